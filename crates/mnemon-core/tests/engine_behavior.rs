use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use mnemon_core::{
    AbortSignal, AgentCall, AgentCallRequest, AgentReply, AgentUsage, InferenceRole, InputStepArgs,
    MemoryEngine, MemoryEngineOptions, MemoryScope, MemoryStore, Message, MessagePart,
    MessagePartKind, MessageRole, MnemonError, OutputResultArgs, SqliteMemoryStore, StreamWriter,
    Thread, ThreadMemoryMetadata, TokenCounter, TokenThreshold, TurnState,
    marker::{MarkerPart, OperationType},
    stream::CollectingStreamWriter,
};

/// Replays canned completions in order, recording every request.
struct ScriptedAgent {
    replies: Mutex<VecDeque<(String, u64)>>,
    calls: Mutex<Vec<(InferenceRole, String)>>,
}

impl ScriptedAgent {
    fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| (r.to_string(), 0)).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_delays(replies: Vec<(&str, u64)>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(r, d)| (r.to_string(), d))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(InferenceRole, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentCall for ScriptedAgent {
    fn call(&self, request: &AgentCallRequest<'_>) -> mnemon_core::Result<AgentReply> {
        let next = self.replies.lock().unwrap().pop_front();
        let Some((text, delay_ms)) = next else {
            return Err(MnemonError::Internal("scripted agent exhausted".into()));
        };
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
        self.calls
            .lock()
            .unwrap()
            .push((request.role, request.user_prompt.to_string()));
        Ok(AgentReply {
            text,
            usage: AgentUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }
}

type Engine = MemoryEngine<SqliteMemoryStore, Arc<ScriptedAgent>>;

fn engine_with(options: MemoryEngineOptions, agent: Arc<ScriptedAgent>) -> Engine {
    MemoryEngine::new(options, SqliteMemoryStore::open_in_memory().unwrap(), agent).unwrap()
}

fn filler_words(count: usize) -> String {
    let vocabulary = [
        "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta",
    ];
    (0..count)
        .map(|i| vocabulary[i % vocabulary.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn user_message(id: &str, thread_id: &str, words: usize, offset_secs: i64) -> Message {
    Message::new(
        id,
        thread_id,
        MessageRole::User,
        vec![MessagePart::text(format!("{id} {}", filler_words(words)))],
        Utc::now() + ChronoDuration::seconds(offset_secs),
    )
}

fn step_args(
    thread_id: &str,
    step_number: u32,
    messages: Vec<Message>,
    step_input: Vec<Message>,
    writer: &Arc<CollectingStreamWriter>,
    abort: &AbortSignal,
) -> InputStepArgs {
    let writer: Arc<dyn StreamWriter> = writer.clone();
    InputStepArgs {
        thread_id: thread_id.to_string(),
        resource_id: None,
        step_number,
        messages,
        step_input,
        step_response: Vec::new(),
        writer,
        abort: abort.clone(),
    }
}

fn progress_markers(markers: &[MarkerPart]) -> Vec<&MarkerPart> {
    markers
        .iter()
        .filter(|m| matches!(m, MarkerPart::Progress(_)))
        .collect()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

const OBSERVER_REPLY: &str = "<observations>\nDate: Dec 4, 2025\n* 🔴 (14:30) User shared project details\n</observations>\n<current-task>\nHelp with the project\n</current-task>";

#[test]
fn threshold_crossing_runs_synchronous_observation() {
    let agent = Arc::new(ScriptedAgent::new(vec![OBSERVER_REPLY]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    let engine = engine_with(options, agent.clone());

    let messages: Vec<Message> = (0..10)
        .map(|i| user_message(&format!("msg-{i}"), "t-1", 45, i))
        .collect();
    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    // Step 0: everything arrives; the threshold branch must not fire yet.
    let step0 = engine
        .process_input_step(
            step_args("t-1", 0, Vec::new(), messages.clone(), &writer, &abort),
            &mut turn,
        )
        .unwrap();
    let markers = writer.drain();
    let progress = progress_markers(&markers);
    assert_eq!(progress.len(), 1);
    let MarkerPart::Progress(progress) = progress[0] else {
        unreachable!()
    };
    assert!(progress.pending_tokens >= 400 && progress.pending_tokens <= 700);
    assert!(progress.will_observe);
    assert!(agent.calls().is_empty());

    // Step 1 takes the lock and observes once.
    let step1 = engine
        .process_input_step(
            step_args("t-1", 1, step0.messages, Vec::new(), &writer, &abort),
            &mut turn,
        )
        .unwrap();
    let calls = agent.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, InferenceRole::Observer);

    let markers = writer.drain();
    let starts = markers
        .iter()
        .filter(|m| matches!(m, MarkerPart::ObservationStart(_)))
        .count();
    let ends: Vec<_> = markers
        .iter()
        .filter_map(|m| match m {
            MarkerPart::ObservationEnd(end) => Some(end),
            _ => None,
        })
        .collect();
    assert_eq!(starts, 1);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].operation_type, OperationType::Observation);

    let record = engine.get_record("t-1", None).unwrap().unwrap();
    assert!(record.active_observations.contains("User shared project details"));
    assert_eq!(record.current_task.as_deref(), Some("Help with the project"));
    assert_eq!(
        record.last_observed_at.map(|x| x.timestamp()),
        messages.iter().map(|m| m.created_at.timestamp()).max()
    );
    assert_eq!(record.observed_message_ids.len(), 10);
    assert!(!record.is_observing);

    // Token accounting matches a fresh count of the active text.
    let counter = TokenCounter::new();
    assert_eq!(
        record.observation_token_count,
        counter.count_text(&record.active_observations)
    );

    // Observed messages are dropped; the injected system message leads.
    assert!(step1.messages.iter().all(|m| !m.id.starts_with("msg-")));
    let first = &step1.messages[0];
    assert_eq!(first.role, MessageRole::System);
    assert!(first.text().contains("<observations>"));

    // The marker host row is persisted and sealed.
    let history = engine.get_history("t-1").unwrap();
    let host = history
        .iter()
        .find(|m| {
            m.parts
                .iter()
                .any(|p| matches!(&p.kind, MessagePartKind::Marker(MarkerPart::ObservationEnd(_))))
        })
        .expect("observation-end host persisted");
    assert!(host.is_sealed());
}

#[test]
fn below_threshold_skips_observer_but_persists_turn() {
    let agent = Arc::new(ScriptedAgent::new(vec![]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    let engine = engine_with(options, agent.clone());

    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let hi = user_message("m-hi", "t-1", 1, 0);
    let step0 = engine
        .process_input_step(
            step_args("t-1", 0, Vec::new(), vec![hi.clone()], &writer, &abort),
            &mut turn,
        )
        .unwrap();
    assert!(agent.calls().is_empty());
    let markers = writer.drain();
    assert!(markers.iter().all(|m| matches!(m, MarkerPart::Progress(_))));

    let reply = Message::new(
        "m-reply",
        "t-1",
        MessageRole::Assistant,
        vec![MessagePart::text("Hello!")],
        Utc::now() + ChronoDuration::seconds(1),
    );
    engine
        .process_output_result(
            OutputResultArgs {
                thread_id: "t-1".into(),
                resource_id: None,
                input: vec![hi],
                response: vec![reply],
            },
            &mut turn,
        )
        .unwrap();

    let history = engine.get_history("t-1").unwrap();
    assert_eq!(history.len(), 2);
    assert!(engine.get_observations("t-1", None).unwrap().is_none());
    let _ = step0;
}

#[test]
fn async_buffering_then_activation_moves_tokens_active() {
    let agent = Arc::new(ScriptedAgent::new(vec![
        "<observations>\n* 🟡 buffered chunk one\n</observations>",
        "<observations>\n* 🟡 buffered chunk two\n</observations>",
    ]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(40.0);
    options.observation.async_activation =
        Some(mnemon_core::ActivationInput::Ratio(0.7));
    options.reflection.async_activation = Some(mnemon_core::ActivationInput::Ratio(0.5));
    let engine = engine_with(options, agent.clone());

    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let mut list = Vec::new();
    for (step, words) in [(0u32, 22usize), (1, 22), (2, 22)] {
        let message = user_message(&format!("m-{step}"), "t-1", words, i64::from(step));
        let processed = engine
            .process_input_step(
                step_args("t-1", step, list, vec![message], &writer, &abort),
                &mut turn,
            )
            .unwrap();
        list = processed.messages;
        // Let any buffering run started by this step drain before the next.
        wait_until(Duration::from_secs(3), || {
            engine
                .get_record("t-1", None)
                .unwrap()
                .is_none_or(|r| !r.is_buffering_observation)
        });
    }

    let markers = writer.drain();
    let buffering_starts = markers
        .iter()
        .filter(|m| matches!(m, MarkerPart::BufferingStart(_)))
        .count();
    let buffering_ends = markers
        .iter()
        .filter(|m| matches!(m, MarkerPart::BufferingEnd(_)))
        .count();
    assert_eq!(buffering_starts, 2, "interval boundaries at 40 and 80");
    assert_eq!(buffering_ends, 2);

    // New turn: step-0 activation swaps the buffered prefix active.
    let mut next_turn = TurnState::new();
    let processed = engine
        .process_input_step(
            step_args("t-1", 0, list, Vec::new(), &writer, &abort),
            &mut next_turn,
        )
        .unwrap();
    let markers = writer.drain();
    let activations: Vec<_> = markers
        .iter()
        .filter_map(|m| match m {
            MarkerPart::Activation(a) => Some(a),
            _ => None,
        })
        .collect();
    assert!(!activations.is_empty());

    let record = engine.get_record("t-1", None).unwrap().unwrap();
    assert!(record.active_observations.contains("buffered chunk one"));
    // ≥ 70% of buffered observation tokens moved active: with two equal
    // chunks that means both.
    assert!(record.active_observations.contains("buffered chunk two"));
    assert_eq!(record.last_buffered_at_tokens, 0);

    // Activated messages are gone from the outgoing list.
    let activated_hosts: Vec<_> = processed
        .messages
        .iter()
        .filter(|m| m.id.starts_with("m-"))
        .collect();
    assert!(activated_hosts.len() < 3);

    // No message fed two distinct observer calls.
    let calls = agent.calls();
    for id in ["m-0", "m-1", "m-2"] {
        let appearances = calls
            .iter()
            .filter(|(_, prompt)| prompt.contains(&format!("{id} alpha")))
            .count();
        assert!(appearances <= 1, "{id} observed twice");
    }
}

const OVERSIZED_REFLECTION: &str = "<observations>\n* reflection attempt one that is intentionally very verbose and long, repeating detail after detail after detail so that the validator rejects it for being larger than the configured compression target, word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word word\n</observations>";
const COMPACT_REFLECTION: &str = "<observations>\n* compact memory\n</observations>";

#[test]
fn reflection_retries_once_after_oversized_first_pass() {
    let agent = Arc::new(ScriptedAgent::new(vec![
        OBSERVER_REPLY,
        OVERSIZED_REFLECTION,
        COMPACT_REFLECTION,
    ]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(50));
    options.reflection.observation_tokens = Some(TokenThreshold::Fixed(10));
    let engine = engine_with(options, agent.clone());

    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let messages: Vec<Message> = (0..4)
        .map(|i| user_message(&format!("msg-{i}"), "t-1", 20, i))
        .collect();
    let step0 = engine
        .process_input_step(
            step_args("t-1", 0, Vec::new(), messages, &writer, &abort),
            &mut turn,
        )
        .unwrap();
    engine
        .process_input_step(
            step_args("t-1", 1, step0.messages, Vec::new(), &writer, &abort),
            &mut turn,
        )
        .unwrap();

    let calls = agent.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].0, InferenceRole::Reflector);
    assert_eq!(calls[2].0, InferenceRole::Reflector);
    assert!(calls[2].1.contains("COMPRESSION REQUIRED"));

    // Marker sequence: start(A) → failed(A) → start(B) → end(B), B ≠ A.
    let markers = writer.drain();
    let reflection_markers: Vec<&MarkerPart> = markers
        .iter()
        .filter(|m| match m {
            MarkerPart::ObservationStart(s) => s.operation_type == OperationType::Reflection,
            MarkerPart::ObservationFailed(f) => f.operation_type == OperationType::Reflection,
            MarkerPart::ObservationEnd(e) => e.operation_type == OperationType::Reflection,
            _ => false,
        })
        .collect();
    assert_eq!(reflection_markers.len(), 4);
    let first_cycle = reflection_markers[0].cycle_id().unwrap().to_string();
    match (&reflection_markers[1], &reflection_markers[2], &reflection_markers[3]) {
        (
            MarkerPart::ObservationFailed(failed),
            MarkerPart::ObservationStart(retry),
            MarkerPart::ObservationEnd(end),
        ) => {
            assert_eq!(failed.cycle_id, first_cycle);
            assert_ne!(retry.cycle_id, first_cycle);
            assert_eq!(end.cycle_id, retry.cycle_id);
        }
        other => panic!("unexpected reflection marker sequence: {other:?}"),
    }

    let record = engine.get_record("t-1", None).unwrap().unwrap();
    assert_eq!(record.generation_count, 1);
    assert_eq!(record.active_observations, "* compact memory");
    assert!(!record.is_reflecting);
    assert!(!record.is_observing);
}

const MULTI_THREAD_REPLY: &str = "<observations>\n<thread id=\"t-1\">\n* 🔴 progress in thread one\n<current-task>finish thread one work</current-task>\n</thread>\n<thread id=\"t-2\">\n* 🟡 side question in thread two\n</thread>\n</observations>";

#[test]
fn resource_scope_observes_multiple_threads_in_one_prompt() {
    let agent = Arc::new(ScriptedAgent::new(vec![MULTI_THREAD_REPLY]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Resource,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    let store = SqliteMemoryStore::open_in_memory().unwrap();

    let now = Utc::now();
    for thread_id in ["t-1", "t-2"] {
        store
            .upsert_thread(&Thread {
                id: thread_id.into(),
                resource_id: Some("r-1".into()),
                memory: ThreadMemoryMetadata::default(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }
    let t2_messages: Vec<Message> = (0..2)
        .map(|i| user_message(&format!("t2-msg-{i}"), "t-2", 30, i).with_resource("r-1"))
        .collect();
    store.save_messages(&t2_messages).unwrap();

    let engine = MemoryEngine::new(options, store, agent.clone()).unwrap();
    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let mut list = Vec::new();
    for step in 0..8u32 {
        let message =
            user_message(&format!("t1-msg-{step}"), "t-1", 20, i64::from(step)).with_resource("r-1");
        let step_writer: Arc<dyn StreamWriter> = writer.clone();
        let args = InputStepArgs {
            thread_id: "t-1".into(),
            resource_id: Some("r-1".into()),
            step_number: step,
            messages: list,
            step_input: vec![message],
            step_response: Vec::new(),
            writer: step_writer,
            abort: abort.clone(),
        };
        list = engine.process_input_step(args, &mut turn).unwrap().messages;
        if !agent.calls().is_empty() {
            break;
        }
    }

    let calls = agent.calls();
    assert_eq!(calls.len(), 1, "one multi-thread prompt");
    assert!(calls[0].1.contains("<thread id=\"t-1\">"));
    assert!(calls[0].1.contains("<thread id=\"t-2\">"));

    let record = engine.get_record("t-1", Some("r-1")).unwrap().unwrap();
    assert!(record.active_observations.contains("<thread id=\"t-1\">"));
    assert!(record.active_observations.contains("<thread id=\"t-2\">"));
    assert!(record.active_observations.contains("progress in thread one"));

    let t1 = engine.get_thread("t-1").unwrap().unwrap();
    let t2 = engine.get_thread("t-2").unwrap().unwrap();
    assert!(t1.memory.last_observed_at.is_some());
    assert!(t2.memory.last_observed_at.is_some());
    assert!(record.last_observed_at.is_some());
}

#[test]
fn abort_mid_reflection_fails_the_cycle_and_propagates() {
    let agent = Arc::new(ScriptedAgent::with_delays(vec![
        (OBSERVER_REPLY, 0),
        (COMPACT_REFLECTION, 400),
    ]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(50));
    options.reflection.observation_tokens = Some(TokenThreshold::Fixed(10));
    let engine = engine_with(options, agent.clone());

    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let messages: Vec<Message> = (0..4)
        .map(|i| user_message(&format!("msg-{i}"), "t-1", 20, i))
        .collect();
    let step0 = engine
        .process_input_step(
            step_args("t-1", 0, Vec::new(), messages, &writer, &abort),
            &mut turn,
        )
        .unwrap();

    let killer = {
        let abort = abort.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            abort.abort();
        })
    };
    let result = engine.process_input_step(
        step_args("t-1", 1, step0.messages, Vec::new(), &writer, &abort),
        &mut turn,
    );
    killer.join().unwrap();

    assert!(matches!(result, Err(MnemonError::Aborted)));
    let markers = writer.drain();
    assert!(markers.iter().any(|m| matches!(
        m,
        MarkerPart::ObservationFailed(f) if f.operation_type == OperationType::Reflection
    )));

    let record = engine.get_record("t-1", None).unwrap().unwrap();
    assert_eq!(record.generation_count, 0);
    assert!(!record.is_reflecting);
}

#[test]
fn buffered_reflection_activates_all_or_nothing() {
    let agent = Arc::new(ScriptedAgent::new(vec![
        "<observations>\n* 🟡 buffered chunk one has quite a lot of detail in it so the record grows past the reflection activation point\n</observations>",
        COMPACT_REFLECTION,
    ]));
    let mut options = MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..Default::default()
    };
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(40.0);
    options.reflection.observation_tokens = Some(TokenThreshold::Fixed(12));
    options.reflection.async_activation = Some(mnemon_core::ActivationInput::Ratio(0.5));
    let engine = engine_with(options, agent.clone());

    let writer = Arc::new(CollectingStreamWriter::new());
    let abort = AbortSignal::new();
    let mut turn = TurnState::new();

    let mut list = Vec::new();
    for step in 0..2u32 {
        let message = user_message(&format!("m-{step}"), "t-1", 30, i64::from(step));
        list = engine
            .process_input_step(
                step_args("t-1", step, list, vec![message], &writer, &abort),
                &mut turn,
            )
            .unwrap()
            .messages;
        wait_until(Duration::from_secs(3), || {
            engine
                .get_record("t-1", None)
                .unwrap()
                .is_none_or(|r| !r.is_buffering_observation)
        });
    }

    // Next turn: activation swaps the chunk active, which pushes the
    // observation span past the async reflection point and buffers a
    // reflection in the background.
    let mut next_turn = TurnState::new();
    engine
        .process_input_step(
            step_args("t-1", 0, list, Vec::new(), &writer, &abort),
            &mut next_turn,
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        engine
            .get_record("t-1", None)
            .unwrap()
            .is_some_and(|r| r.has_buffered_reflection())
    }));

    let record = engine.get_record("t-1", None).unwrap().unwrap();
    assert!(record.reflected_observation_line_count.is_some());

    // Explicit reflect activates the buffered result without another call.
    let calls_before = agent.calls().len();
    let updated = engine.reflect("t-1", None, None).unwrap().unwrap();
    assert_eq!(agent.calls().len(), calls_before);
    assert_eq!(updated.generation_count, 1);
    assert!(updated.active_observations.starts_with("* compact memory"));
    assert!(!updated.has_buffered_reflection());
}
