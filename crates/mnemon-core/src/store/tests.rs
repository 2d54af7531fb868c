use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::InferenceRole;
use crate::models::{
    MemoryScope, Message, MessagePart, MessageRole, ObservationChunk, OriginType,
    ThreadMemoryMetadata,
};
use crate::store::{
    ActiveObservationsUpdate, BufferedReflectionUpdate, MemoryStore, RecordInit, SqliteMemoryStore,
};
use crate::token::TokenCounter;

fn store() -> SqliteMemoryStore {
    SqliteMemoryStore::open_in_memory().expect("in-memory store")
}

fn thread_record(store: &SqliteMemoryStore) -> crate::models::MemoryRecord {
    store
        .initialize_record(RecordInit {
            scope: MemoryScope::Thread,
            scope_key: "thread:t-1",
            thread_id: Some("t-1"),
            resource_id: None,
        })
        .expect("initialize")
}

fn chunk(record_id: &str, cycle: &str, tokens: u32, message_tokens: u32, ids: &[&str]) -> ObservationChunk {
    let now = Utc::now();
    ObservationChunk {
        id: Uuid::new_v4().to_string(),
        record_id: record_id.to_string(),
        seq: 0,
        cycle_id: cycle.to_string(),
        observations: format!("* buffered via {cycle}"),
        token_count: tokens,
        message_tokens,
        message_ids: ids.iter().map(ToString::to_string).collect(),
        last_observed_at: now,
        created_at: now,
    }
}

#[test]
fn initialize_is_idempotent() {
    let store = store();
    let first = thread_record(&store);
    let second = thread_record(&store);
    assert_eq!(first.id, second.id);
    assert_eq!(first.scope_key, "thread:t-1");
    assert_eq!(first.origin_type, OriginType::Initial);
}

#[test]
fn active_observation_update_round_trips() {
    let store = store();
    let record = thread_record(&store);
    let observed = vec!["m-1".to_string(), "m-2".to_string()];
    let now = Utc::now();
    store
        .update_active_observations(ActiveObservationsUpdate {
            record_id: &record.id,
            observations: "* fact",
            token_count: 3,
            pending_message_tokens: 0,
            last_observed_at: now,
            observed_message_ids: &observed,
            current_task: Some("ship it"),
            suggested_response: None,
        })
        .unwrap();

    let loaded = store.get_record("thread:t-1").unwrap().unwrap();
    assert_eq!(loaded.active_observations, "* fact");
    assert_eq!(loaded.observation_token_count, 3);
    assert_eq!(loaded.observed_message_ids, observed);
    assert_eq!(loaded.current_task.as_deref(), Some("ship it"));
    assert_eq!(
        loaded.last_observed_at.map(|x| x.timestamp()),
        Some(now.timestamp())
    );
}

#[test]
fn chunks_append_with_monotonic_seq() {
    let store = store();
    let record = thread_record(&store);
    store
        .append_buffered_chunk(&chunk(&record.id, "a", 10, 50, &["m1"]))
        .unwrap();
    store
        .append_buffered_chunk(&chunk(&record.id, "b", 20, 60, &["m2"]))
        .unwrap();
    let chunks = store.list_buffered_chunks(&record.id).unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].cycle_id, "a");
    assert_eq!(chunks[0].seq, 0);
    assert_eq!(chunks[1].cycle_id, "b");
    assert_eq!(chunks[1].seq, 1);
}

#[test]
fn swap_with_zero_chunks_is_none() {
    let store = store();
    let record = thread_record(&store);
    assert!(store.swap_buffered_to_active(&record.id, 0.7).unwrap().is_none());
}

#[test]
fn swap_activates_prefix_and_updates_record() {
    let store = store();
    let record = thread_record(&store);
    store.update_pending_tokens(&record.id, 200).unwrap();
    store
        .append_buffered_chunk(&chunk(&record.id, "a", 50, 90, &["m1"]))
        .unwrap();
    store
        .append_buffered_chunk(&chunk(&record.id, "b", 30, 70, &["m2"]))
        .unwrap();
    store
        .append_buffered_chunk(&chunk(&record.id, "c", 20, 40, &["m3"]))
        .unwrap();

    let swap = store
        .swap_buffered_to_active(&record.id, 0.7)
        .unwrap()
        .unwrap();
    assert_eq!(swap.chunks_activated, 2);
    assert_eq!(swap.activated_cycle_ids, vec!["a", "b"]);
    assert_eq!(swap.message_tokens_activated, 160);
    assert!(swap.record.active_observations.contains("* buffered via a"));
    assert!(swap.record.active_observations.contains("* buffered via b"));
    assert!(!swap.record.active_observations.contains("* buffered via c"));
    assert_eq!(swap.record.pending_message_tokens, 40);
    assert_eq!(
        swap.record.observed_message_ids,
        vec!["m1".to_string(), "m2".to_string()]
    );

    // Token count is recounted on the merged text.
    let counter = TokenCounter::new();
    assert_eq!(
        swap.record.observation_token_count,
        counter.count_text(&swap.record.active_observations)
    );

    let remaining = store.list_buffered_chunks(&record.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].cycle_id, "c");
}

#[test]
fn full_swap_resets_buffer_boundary() {
    let store = store();
    let record = thread_record(&store);
    store
        .set_buffering_observation_flag(&record.id, true, Some(80))
        .unwrap();
    store
        .append_buffered_chunk(&chunk(&record.id, "a", 50, 90, &["m1"]))
        .unwrap();
    let swap = store
        .swap_buffered_to_active(&record.id, 1.0)
        .unwrap()
        .unwrap();
    assert_eq!(swap.record.last_buffered_at_tokens, 0);
    assert!(!swap.record.is_buffering_observation);
}

#[test]
fn buffered_reflection_swap_merges_and_increments_generation() {
    let store = store();
    let record = thread_record(&store);
    store
        .update_active_observations(ActiveObservationsUpdate {
            record_id: &record.id,
            observations: "* a\n* b\n* c",
            token_count: 9,
            pending_message_tokens: 0,
            last_observed_at: Utc::now(),
            observed_message_ids: &[],
            current_task: None,
            suggested_response: None,
        })
        .unwrap();
    store
        .update_buffered_reflection(BufferedReflectionUpdate {
            record_id: &record.id,
            reflection: "* compressed",
            token_count: 3,
            reflected_observation_line_count: 2,
        })
        .unwrap();

    let swapped = store
        .swap_buffered_reflection_to_active(&record.id, 5)
        .unwrap()
        .unwrap();
    assert_eq!(swapped.active_observations, "* compressed\n\n* c");
    assert_eq!(swapped.generation_count, 1);
    assert_eq!(swapped.origin_type, OriginType::Reflection);
    assert!(swapped.buffered_reflection.is_none());
    assert!(swapped.reflected_observation_line_count.is_none());

    // Second swap finds nothing buffered.
    assert!(
        store
            .swap_buffered_reflection_to_active(&record.id, 5)
            .unwrap()
            .is_none()
    );
}

#[test]
fn reflection_generation_replaces_active_text() {
    let store = store();
    let record = thread_record(&store);
    let updated = store
        .create_reflection_generation(&record.id, "* new memory", 4, Some("task"), None)
        .unwrap();
    assert_eq!(updated.active_observations, "* new memory");
    assert_eq!(updated.generation_count, 1);
    assert_eq!(updated.current_task.as_deref(), Some("task"));
    assert!(!updated.is_reflecting);
}

#[test]
fn flags_and_trigger_counters_persist() {
    let store = store();
    let record = thread_record(&store);
    store.set_observing_flag(&record.id, true).unwrap();
    store
        .set_buffering_observation_flag(&record.id, true, Some(40))
        .unwrap();
    store.record_trigger(&record.id, InferenceRole::Observer).unwrap();
    store.record_trigger(&record.id, InferenceRole::Reflector).unwrap();

    let loaded = store.get_record("thread:t-1").unwrap().unwrap();
    assert!(loaded.is_observing);
    assert!(loaded.is_buffering_observation);
    assert_eq!(loaded.last_buffered_at_tokens, 40);
    assert_eq!(loaded.observer_trigger_count_total, 1);
    assert_eq!(loaded.reflector_trigger_count_total, 1);

    store.set_observing_flag(&record.id, false).unwrap();
    assert!(!store.get_record("thread:t-1").unwrap().unwrap().is_observing);
}

#[test]
fn messages_upsert_and_filter_by_cursor() {
    let store = store();
    let base = Utc::now();
    let older = Message::new(
        "m-1",
        "t-1",
        MessageRole::User,
        vec![MessagePart::text("first")],
        base,
    );
    let newer = Message::new(
        "m-2",
        "t-1",
        MessageRole::Assistant,
        vec![MessagePart::text("second")],
        base + Duration::seconds(5),
    )
    .with_resource("r-1");
    store.save_messages(&[older.clone(), newer.clone()]).unwrap();

    let all = store.list_thread_messages("t-1", None).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, "m-1");

    let after = store.list_thread_messages("t-1", Some(base)).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, "m-2");

    let by_resource = store.list_resource_messages("r-1", None).unwrap();
    assert_eq!(by_resource.len(), 1);

    // Upsert by id replaces parts rather than duplicating the row.
    let mut rewritten = older;
    rewritten.parts = vec![MessagePart::text("rewritten")];
    store.save_messages(&[rewritten]).unwrap();
    let all = store.list_thread_messages("t-1", None).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].text(), "rewritten");
}

#[test]
fn thread_memory_updates_create_missing_rows() {
    let store = store();
    let cursor = Utc::now();
    store
        .update_thread_memory(
            "t-9",
            &ThreadMemoryMetadata {
                last_observed_at: Some(cursor),
                current_task: Some("task".into()),
                suggested_response: None,
            },
        )
        .unwrap();
    let thread = store.get_thread("t-9").unwrap().unwrap();
    assert_eq!(
        thread.memory.last_observed_at.map(|x| x.timestamp()),
        Some(cursor.timestamp())
    );
    assert_eq!(thread.memory.current_task.as_deref(), Some("task"));
}

#[test]
fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.sqlite");
    {
        let store = SqliteMemoryStore::open(&path).unwrap();
        let record = thread_record(&store);
        store
            .update_active_observations(ActiveObservationsUpdate {
                record_id: &record.id,
                observations: "* durable fact",
                token_count: 3,
                pending_message_tokens: 12,
                last_observed_at: Utc::now(),
                observed_message_ids: &["m-1".to_string()],
                current_task: None,
                suggested_response: None,
            })
            .unwrap();
    }
    let reopened = SqliteMemoryStore::open(&path).unwrap();
    let record = reopened.get_record("thread:t-1").unwrap().unwrap();
    assert_eq!(record.active_observations, "* durable fact");
    assert_eq!(record.pending_message_tokens, 12);
    assert_eq!(record.observed_message_ids, vec!["m-1".to_string()]);
}

#[test]
fn clear_scope_destroys_record_and_chunks_only() {
    let store = store();
    let record = thread_record(&store);
    store
        .append_buffered_chunk(&chunk(&record.id, "a", 5, 5, &["m1"]))
        .unwrap();
    store
        .save_messages(&[Message::new(
            "m-1",
            "t-1",
            MessageRole::User,
            vec![MessagePart::text("kept")],
            Utc::now(),
        )])
        .unwrap();

    store.clear_scope("thread:t-1").unwrap();
    assert!(store.get_record("thread:t-1").unwrap().is_none());
    assert!(store.list_buffered_chunks(&record.id).unwrap().is_empty());
    assert_eq!(store.list_thread_messages("t-1", None).unwrap().len(), 1);
}
