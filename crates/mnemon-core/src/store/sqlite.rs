use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use uuid::Uuid;

use crate::error::{InferenceRole, MnemonError, Result};
use crate::models::{
    MemoryRecord, MemoryScope, Message, MessagePart, MessageRole, ObservationChunk, OriginType,
    Thread, ThreadMemoryMetadata,
};
use crate::observe::{merge_buffered_reflection, merge_observation_texts, select_activation_boundary};
use crate::token::TokenCounter;

use super::{
    ActivationSwap, ActiveObservationsUpdate, BufferedReflectionUpdate, MemoryStore, RecordInit,
};

/// SQLite-backed [`MemoryStore`]. One connection guarded by a mutex; every
/// multi-statement operation runs inside a transaction.
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
    counter: TokenCounter,
}

impl std::fmt::Debug for SqliteMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMemoryStore").finish_non_exhaustive()
    }
}

const RECORD_COLUMNS: &str = "\
    id, scope, scope_key, thread_id, resource_id, origin_type, \
    active_observations, observation_token_count, pending_message_tokens, \
    last_observed_at, observed_message_ids_json, current_task, suggested_response, \
    is_observing, is_reflecting, is_buffering_observation, is_buffering_reflection, \
    last_buffered_at_tokens, buffered_reflection, buffered_reflection_tokens, \
    reflected_observation_line_count, generation_count, \
    observer_trigger_count_total, reflector_trigger_count_total, created_at, updated_at";

impl SqliteMemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            counter: TokenCounter::new(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| MnemonError::lock_poisoned("sqlite"))?;
        f(&conn)
    }

    fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| MnemonError::lock_poisoned("sqlite"))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        drop(conn);
        Ok(value)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS memory_records (
                    id TEXT PRIMARY KEY,
                    scope TEXT NOT NULL,
                    scope_key TEXT NOT NULL UNIQUE,
                    thread_id TEXT,
                    resource_id TEXT,
                    origin_type TEXT NOT NULL,
                    active_observations TEXT NOT NULL,
                    observation_token_count INTEGER NOT NULL,
                    pending_message_tokens INTEGER NOT NULL,
                    last_observed_at TEXT,
                    observed_message_ids_json TEXT NOT NULL,
                    current_task TEXT,
                    suggested_response TEXT,
                    is_observing INTEGER NOT NULL,
                    is_reflecting INTEGER NOT NULL,
                    is_buffering_observation INTEGER NOT NULL,
                    is_buffering_reflection INTEGER NOT NULL,
                    last_buffered_at_tokens INTEGER NOT NULL,
                    buffered_reflection TEXT,
                    buffered_reflection_tokens INTEGER,
                    reflected_observation_line_count INTEGER,
                    generation_count INTEGER NOT NULL,
                    observer_trigger_count_total INTEGER NOT NULL,
                    reflector_trigger_count_total INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS observation_chunks (
                    id TEXT PRIMARY KEY,
                    record_id TEXT NOT NULL REFERENCES memory_records(id),
                    seq INTEGER NOT NULL,
                    cycle_id TEXT NOT NULL,
                    observations TEXT NOT NULL,
                    token_count INTEGER NOT NULL,
                    message_tokens INTEGER NOT NULL,
                    message_ids_json TEXT NOT NULL,
                    last_observed_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_observation_chunks_record
                    ON observation_chunks(record_id, seq);
                CREATE TABLE IF NOT EXISTS threads (
                    id TEXT PRIMARY KEY,
                    resource_id TEXT,
                    last_observed_at TEXT,
                    current_task TEXT,
                    suggested_response TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_threads_resource ON threads(resource_id);
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    resource_id TEXT,
                    role TEXT NOT NULL,
                    parts_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_thread
                    ON messages(thread_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_messages_resource
                    ON messages(resource_id, created_at);
                ",
            )?;
            Ok(())
        })
    }
}

fn bool_to_i64(value: bool) -> i64 {
    i64::from(value)
}

fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(if value < 0 { 0 } else { u32::MAX })
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_rfc3339(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| conversion_error(index, format!("invalid timestamp: {err}")))
}

fn parse_optional_rfc3339(index: usize, raw: Option<&str>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_rfc3339(index, value)).transpose()
}

fn parse_string_vec(index: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw)
        .map_err(|err| conversion_error(index, format!("invalid id list: {err}")))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let scope_raw = row.get::<_, String>(1)?;
    let scope = MemoryScope::parse(&scope_raw)
        .ok_or_else(|| conversion_error(1, format!("invalid scope: {scope_raw}")))?;
    let origin_raw = row.get::<_, String>(5)?;
    let origin_type = OriginType::parse(&origin_raw)
        .ok_or_else(|| conversion_error(5, format!("invalid origin_type: {origin_raw}")))?;

    let last_observed_raw = row.get::<_, Option<String>>(9)?;
    let observed_ids_raw = row.get::<_, String>(10)?;
    let created_at_raw = row.get::<_, String>(24)?;
    let updated_at_raw = row.get::<_, String>(25)?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        scope,
        scope_key: row.get(2)?,
        thread_id: row.get(3)?,
        resource_id: row.get(4)?,
        origin_type,
        active_observations: row.get(6)?,
        observation_token_count: i64_to_u32(row.get::<_, i64>(7)?),
        pending_message_tokens: i64_to_u32(row.get::<_, i64>(8)?),
        last_observed_at: parse_optional_rfc3339(9, last_observed_raw.as_deref())?,
        observed_message_ids: parse_string_vec(10, &observed_ids_raw)?,
        current_task: row.get(11)?,
        suggested_response: row.get(12)?,
        is_observing: row.get::<_, i64>(13)? != 0,
        is_reflecting: row.get::<_, i64>(14)? != 0,
        is_buffering_observation: row.get::<_, i64>(15)? != 0,
        is_buffering_reflection: row.get::<_, i64>(16)? != 0,
        last_buffered_at_tokens: i64_to_u32(row.get::<_, i64>(17)?),
        buffered_reflection: row.get(18)?,
        buffered_reflection_tokens: row.get::<_, Option<i64>>(19)?.map(i64_to_u32),
        reflected_observation_line_count: row.get::<_, Option<i64>>(20)?.map(i64_to_u32),
        generation_count: i64_to_u32(row.get::<_, i64>(21)?),
        observer_trigger_count_total: i64_to_u32(row.get::<_, i64>(22)?),
        reflector_trigger_count_total: i64_to_u32(row.get::<_, i64>(23)?),
        created_at: parse_rfc3339(24, &created_at_raw)?,
        updated_at: parse_rfc3339(25, &updated_at_raw)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ObservationChunk> {
    let message_ids_raw = row.get::<_, String>(7)?;
    let last_observed_raw = row.get::<_, String>(8)?;
    let created_at_raw = row.get::<_, String>(9)?;
    Ok(ObservationChunk {
        id: row.get(0)?,
        record_id: row.get(1)?,
        seq: i64_to_u32(row.get::<_, i64>(2)?),
        cycle_id: row.get(3)?,
        observations: row.get(4)?,
        token_count: i64_to_u32(row.get::<_, i64>(5)?),
        message_tokens: i64_to_u32(row.get::<_, i64>(6)?),
        message_ids: parse_string_vec(7, &message_ids_raw)?,
        last_observed_at: parse_rfc3339(8, &last_observed_raw)?,
        created_at: parse_rfc3339(9, &created_at_raw)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_raw = row.get::<_, String>(3)?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid role: {role_raw}")))?;
    let parts_raw = row.get::<_, String>(4)?;
    let parts = serde_json::from_str::<Vec<MessagePart>>(&parts_raw)
        .map_err(|err| conversion_error(4, format!("invalid parts: {err}")))?;
    let created_at_raw = row.get::<_, String>(5)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        resource_id: row.get(2)?,
        role,
        parts,
        created_at: parse_rfc3339(5, &created_at_raw)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let last_observed_raw = row.get::<_, Option<String>>(2)?;
    let created_at_raw = row.get::<_, String>(5)?;
    let updated_at_raw = row.get::<_, String>(6)?;
    Ok(Thread {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        memory: ThreadMemoryMetadata {
            last_observed_at: parse_optional_rfc3339(2, last_observed_raw.as_deref())?,
            current_task: row.get(3)?,
            suggested_response: row.get(4)?,
        },
        created_at: parse_rfc3339(5, &created_at_raw)?,
        updated_at: parse_rfc3339(6, &updated_at_raw)?,
    })
}

fn get_record_tx(
    tx: &rusqlite::Transaction<'_>,
    record_id: &str,
) -> Result<Option<MemoryRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM memory_records WHERE id = ?1");
    let record = tx
        .query_row(&sql, params![record_id], record_from_row)
        .optional()?;
    Ok(record)
}

fn list_chunks_tx(
    tx: &rusqlite::Transaction<'_>,
    record_id: &str,
) -> Result<Vec<ObservationChunk>> {
    let mut stmt = tx.prepare(
        r"
        SELECT id, record_id, seq, cycle_id, observations,
               token_count, message_tokens, message_ids_json,
               last_observed_at, created_at
        FROM observation_chunks
        WHERE record_id = ?1
        ORDER BY seq ASC, created_at ASC
        ",
    )?;
    let rows = stmt.query_map(params![record_id], chunk_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl MemoryStore for SqliteMemoryStore {
    fn get_record(&self, scope_key: &str) -> Result<Option<MemoryRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM memory_records WHERE scope_key = ?1");
            let record = conn
                .query_row(&sql, params![scope_key], record_from_row)
                .optional()?;
            Ok(record)
        })
    }

    fn initialize_record(&self, init: RecordInit<'_>) -> Result<MemoryRecord> {
        if let Some(existing) = self.get_record(init.scope_key)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            scope: init.scope,
            scope_key: init.scope_key.to_string(),
            thread_id: init.thread_id.map(ToString::to_string),
            resource_id: init.resource_id.map(ToString::to_string),
            origin_type: OriginType::Initial,
            active_observations: String::new(),
            observation_token_count: 0,
            pending_message_tokens: 0,
            last_observed_at: None,
            observed_message_ids: Vec::new(),
            current_task: None,
            suggested_response: None,
            is_observing: false,
            is_reflecting: false,
            is_buffering_observation: false,
            is_buffering_reflection: false,
            last_buffered_at_tokens: 0,
            buffered_reflection: None,
            buffered_reflection_tokens: None,
            reflected_observation_line_count: None,
            generation_count: 0,
            observer_trigger_count_total: 0,
            reflector_trigger_count_total: 0,
            created_at: now,
            updated_at: now,
        };
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO memory_records ({RECORD_COLUMNS}) VALUES (\
                     ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
                ),
                params![
                    record.id,
                    record.scope.as_str(),
                    record.scope_key,
                    record.thread_id,
                    record.resource_id,
                    record.origin_type.as_str(),
                    record.active_observations,
                    i64::from(record.observation_token_count),
                    i64::from(record.pending_message_tokens),
                    record.last_observed_at.map(|x| x.to_rfc3339()),
                    serde_json::to_string(&record.observed_message_ids)?,
                    record.current_task,
                    record.suggested_response,
                    bool_to_i64(record.is_observing),
                    bool_to_i64(record.is_reflecting),
                    bool_to_i64(record.is_buffering_observation),
                    bool_to_i64(record.is_buffering_reflection),
                    i64::from(record.last_buffered_at_tokens),
                    record.buffered_reflection,
                    record.buffered_reflection_tokens.map(i64::from),
                    record.reflected_observation_line_count.map(i64::from),
                    i64::from(record.generation_count),
                    i64::from(record.observer_trigger_count_total),
                    i64::from(record.reflector_trigger_count_total),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        // A concurrent initialize may have won the insert; the stored row is
        // authoritative either way.
        self.get_record(init.scope_key)?.ok_or_else(|| {
            MnemonError::Internal(format!(
                "record vanished after initialize for scope_key={}",
                init.scope_key
            ))
        })
    }

    fn update_active_observations(&self, update: ActiveObservationsUpdate<'_>) -> Result<()> {
        let observed_ids_json = serde_json::to_string(update.observed_message_ids)?;
        self.with_conn(|conn| {
            let affected = conn.execute(
                r"
                UPDATE memory_records
                SET active_observations = ?2,
                    observation_token_count = ?3,
                    pending_message_tokens = ?4,
                    last_observed_at = ?5,
                    observed_message_ids_json = ?6,
                    current_task = COALESCE(?7, current_task),
                    suggested_response = COALESCE(?8, suggested_response),
                    updated_at = ?9
                WHERE id = ?1
                ",
                params![
                    update.record_id,
                    update.observations,
                    i64::from(update.token_count),
                    i64::from(update.pending_message_tokens),
                    update.last_observed_at.to_rfc3339(),
                    observed_ids_json,
                    update.current_task,
                    update.suggested_response,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if affected == 0 {
                return Err(MnemonError::NotFound(format!(
                    "memory record {}",
                    update.record_id
                )));
            }
            Ok(())
        })
    }

    fn update_pending_tokens(&self, record_id: &str, pending_message_tokens: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_records SET pending_message_tokens = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    record_id,
                    i64::from(pending_message_tokens),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    fn append_buffered_chunk(&self, chunk: &ObservationChunk) -> Result<()> {
        let message_ids_json = serde_json::to_string(&chunk.message_ids)?;
        self.with_tx(|tx| {
            let next_seq = tx.query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM observation_chunks WHERE record_id = ?1",
                params![chunk.record_id],
                |row| row.get::<_, i64>(0),
            )?;
            tx.execute(
                r"
                INSERT INTO observation_chunks(
                    id, record_id, seq, cycle_id, observations,
                    token_count, message_tokens, message_ids_json,
                    last_observed_at, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
                params![
                    chunk.id,
                    chunk.record_id,
                    next_seq,
                    chunk.cycle_id,
                    chunk.observations,
                    i64::from(chunk.token_count),
                    i64::from(chunk.message_tokens),
                    message_ids_json,
                    chunk.last_observed_at.to_rfc3339(),
                    chunk.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn list_buffered_chunks(&self, record_id: &str) -> Result<Vec<ObservationChunk>> {
        self.with_tx(|tx| list_chunks_tx(tx, record_id))
    }

    fn update_buffered_reflection(&self, update: BufferedReflectionUpdate<'_>) -> Result<()> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                r"
                UPDATE memory_records
                SET buffered_reflection = ?2,
                    buffered_reflection_tokens = ?3,
                    reflected_observation_line_count = ?4,
                    is_buffering_reflection = 0,
                    updated_at = ?5
                WHERE id = ?1
                ",
                params![
                    update.record_id,
                    update.reflection,
                    i64::from(update.token_count),
                    i64::from(update.reflected_observation_line_count),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if affected == 0 {
                return Err(MnemonError::NotFound(format!(
                    "memory record {}",
                    update.record_id
                )));
            }
            Ok(())
        })
    }

    fn swap_buffered_to_active(
        &self,
        record_id: &str,
        activation_ratio: f32,
    ) -> Result<Option<ActivationSwap>> {
        self.with_tx(|tx| {
            let Some(record) = get_record_tx(tx, record_id)? else {
                return Err(MnemonError::NotFound(format!("memory record {record_id}")));
            };
            let chunks = list_chunks_tx(tx, record_id)?;
            if chunks.is_empty() {
                return Ok(None);
            }

            let boundary = select_activation_boundary(&chunks, activation_ratio);
            let activated = &chunks[..boundary.chunks_activated];

            let mut active = record.active_observations.clone();
            let mut moved = String::new();
            for chunk in activated {
                active = merge_observation_texts(&active, &chunk.observations);
                moved = merge_observation_texts(&moved, &chunk.observations);
            }
            let token_count = self.counter.count_text(&active);

            let mut observed_message_ids = record.observed_message_ids.clone();
            for id in &boundary.activated_message_ids {
                if !observed_message_ids.contains(id) {
                    observed_message_ids.push(id.clone());
                }
            }
            let last_observed_at = activated
                .last()
                .map(|chunk| chunk.last_observed_at)
                .or(record.last_observed_at);
            let pending = record
                .pending_message_tokens
                .saturating_sub(boundary.message_tokens_activated);
            let buffer_drained = boundary.chunks_activated >= chunks.len();

            let max_seq = activated.last().map_or(0, |chunk| chunk.seq);
            tx.execute(
                "DELETE FROM observation_chunks WHERE record_id = ?1 AND seq <= ?2",
                params![record_id, i64::from(max_seq)],
            )?;
            tx.execute(
                r"
                UPDATE memory_records
                SET active_observations = ?2,
                    observation_token_count = ?3,
                    pending_message_tokens = ?4,
                    last_observed_at = ?5,
                    observed_message_ids_json = ?6,
                    is_buffering_observation = ?7,
                    last_buffered_at_tokens = ?8,
                    updated_at = ?9
                WHERE id = ?1
                ",
                params![
                    record_id,
                    active,
                    i64::from(token_count),
                    i64::from(pending),
                    last_observed_at.map(|x| x.to_rfc3339()),
                    serde_json::to_string(&observed_message_ids)?,
                    bool_to_i64(!buffer_drained && record.is_buffering_observation),
                    // Interval tracking restarts after every activation.
                    0i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            let record = get_record_tx(tx, record_id)?.ok_or_else(|| {
                MnemonError::Internal(format!("memory record {record_id} vanished during swap"))
            })?;
            Ok(Some(ActivationSwap {
                record,
                activated_cycle_ids: boundary.activated_cycle_ids,
                chunks_activated: boundary.chunks_activated,
                message_tokens_activated: boundary.message_tokens_activated,
                observation_tokens_activated: boundary.observation_tokens_activated,
                messages_activated: boundary.messages_activated,
                activated_message_ids: boundary.activated_message_ids,
                observations: moved,
            }))
        })
    }

    fn swap_buffered_reflection_to_active(
        &self,
        record_id: &str,
        token_count: u32,
    ) -> Result<Option<MemoryRecord>> {
        self.with_tx(|tx| {
            let Some(record) = get_record_tx(tx, record_id)? else {
                return Err(MnemonError::NotFound(format!("memory record {record_id}")));
            };
            let Some(reflection) = record
                .buffered_reflection
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
            else {
                return Ok(None);
            };
            let reflected_lines = record
                .reflected_observation_line_count
                .map_or(0usize, |value| usize::try_from(value).unwrap_or(usize::MAX));
            let merged = merge_buffered_reflection(
                &record.active_observations,
                reflected_lines,
                reflection,
            );

            tx.execute(
                r"
                UPDATE memory_records
                SET active_observations = ?2,
                    observation_token_count = ?3,
                    origin_type = 'reflection',
                    generation_count = generation_count + 1,
                    buffered_reflection = NULL,
                    buffered_reflection_tokens = NULL,
                    reflected_observation_line_count = NULL,
                    is_reflecting = 0,
                    is_buffering_reflection = 0,
                    updated_at = ?4
                WHERE id = ?1
                ",
                params![
                    record_id,
                    merged,
                    i64::from(token_count),
                    Utc::now().to_rfc3339()
                ],
            )?;
            get_record_tx(tx, record_id)
        })
    }

    fn create_reflection_generation(
        &self,
        record_id: &str,
        reflection: &str,
        token_count: u32,
        current_task: Option<&str>,
        suggested_response: Option<&str>,
    ) -> Result<MemoryRecord> {
        self.with_tx(|tx| {
            let affected = tx.execute(
                r"
                UPDATE memory_records
                SET active_observations = ?2,
                    observation_token_count = ?3,
                    origin_type = 'reflection',
                    generation_count = generation_count + 1,
                    buffered_reflection = NULL,
                    buffered_reflection_tokens = NULL,
                    reflected_observation_line_count = NULL,
                    is_reflecting = 0,
                    is_buffering_reflection = 0,
                    current_task = COALESCE(?4, current_task),
                    suggested_response = COALESCE(?5, suggested_response),
                    updated_at = ?6
                WHERE id = ?1
                ",
                params![
                    record_id,
                    reflection,
                    i64::from(token_count),
                    current_task,
                    suggested_response,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if affected == 0 {
                return Err(MnemonError::NotFound(format!("memory record {record_id}")));
            }
            get_record_tx(tx, record_id)?.ok_or_else(|| {
                MnemonError::Internal(format!("memory record {record_id} vanished"))
            })
        })
    }

    fn set_observing_flag(&self, record_id: &str, on: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_records SET is_observing = ?2, updated_at = ?3 WHERE id = ?1",
                params![record_id, bool_to_i64(on), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn set_reflecting_flag(&self, record_id: &str, on: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_records SET is_reflecting = ?2, updated_at = ?3 WHERE id = ?1",
                params![record_id, bool_to_i64(on), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn set_buffering_observation_flag(
        &self,
        record_id: &str,
        on: bool,
        boundary: Option<u32>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            match boundary {
                Some(boundary) => conn.execute(
                    r"
                    UPDATE memory_records
                    SET is_buffering_observation = ?2,
                        last_buffered_at_tokens = ?3,
                        updated_at = ?4
                    WHERE id = ?1
                    ",
                    params![
                        record_id,
                        bool_to_i64(on),
                        i64::from(boundary),
                        Utc::now().to_rfc3339()
                    ],
                )?,
                None => conn.execute(
                    "UPDATE memory_records SET is_buffering_observation = ?2, updated_at = ?3 WHERE id = ?1",
                    params![record_id, bool_to_i64(on), Utc::now().to_rfc3339()],
                )?,
            };
            Ok(())
        })
    }

    fn set_buffering_reflection_flag(&self, record_id: &str, on: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_records SET is_buffering_reflection = ?2, updated_at = ?3 WHERE id = ?1",
                params![record_id, bool_to_i64(on), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn record_trigger(&self, record_id: &str, role: InferenceRole) -> Result<()> {
        let column = match role {
            InferenceRole::Observer => "observer_trigger_count_total",
            InferenceRole::Reflector => "reflector_trigger_count_total",
        };
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE memory_records SET {column} = {column} + 1, updated_at = ?2 WHERE id = ?1"
                ),
                params![record_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        self.with_conn(|conn| {
            let thread = conn
                .query_row(
                    r"
                    SELECT id, resource_id, last_observed_at, current_task,
                           suggested_response, created_at, updated_at
                    FROM threads WHERE id = ?1
                    ",
                    params![thread_id],
                    thread_from_row,
                )
                .optional()?;
            Ok(thread)
        })
    }

    fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r"
                INSERT INTO threads(
                    id, resource_id, last_observed_at, current_task,
                    suggested_response, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    resource_id = excluded.resource_id,
                    last_observed_at = excluded.last_observed_at,
                    current_task = excluded.current_task,
                    suggested_response = excluded.suggested_response,
                    updated_at = excluded.updated_at
                ",
                params![
                    thread.id,
                    thread.resource_id,
                    thread.memory.last_observed_at.map(|x| x.to_rfc3339()),
                    thread.memory.current_task,
                    thread.memory.suggested_response,
                    thread.created_at.to_rfc3339(),
                    thread.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn list_threads_by_resource(&self, resource_id: &str) -> Result<Vec<Thread>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, resource_id, last_observed_at, current_task,
                       suggested_response, created_at, updated_at
                FROM threads WHERE resource_id = ?1
                ORDER BY created_at ASC, id ASC
                ",
            )?;
            let rows = stmt.query_map(params![resource_id], thread_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn update_thread_memory(&self, thread_id: &str, memory: &ThreadMemoryMetadata) -> Result<()> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let affected = conn.execute(
                r"
                UPDATE threads
                SET last_observed_at = ?2,
                    current_task = COALESCE(?3, current_task),
                    suggested_response = COALESCE(?4, suggested_response),
                    updated_at = ?5
                WHERE id = ?1
                ",
                params![
                    thread_id,
                    memory.last_observed_at.map(|x| x.to_rfc3339()),
                    memory.current_task,
                    memory.suggested_response,
                    now,
                ],
            )?;
            if affected == 0 {
                conn.execute(
                    r"
                    INSERT INTO threads(
                        id, resource_id, last_observed_at, current_task,
                        suggested_response, created_at, updated_at
                    )
                    VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?5)
                    ",
                    params![
                        thread_id,
                        memory.last_observed_at.map(|x| x.to_rfc3339()),
                        memory.current_task,
                        memory.suggested_response,
                        now,
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn save_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.with_tx(|tx| {
            for message in messages {
                tx.execute(
                    r"
                    INSERT INTO messages(id, thread_id, resource_id, role, parts_json, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(id) DO UPDATE SET
                        thread_id = excluded.thread_id,
                        resource_id = excluded.resource_id,
                        role = excluded.role,
                        parts_json = excluded.parts_json,
                        created_at = excluded.created_at
                    ",
                    params![
                        message.id,
                        message.thread_id,
                        message.resource_id,
                        message.role.as_str(),
                        serde_json::to_string(&message.parts)?,
                        message.created_at.to_rfc3339(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn list_thread_messages(
        &self,
        thread_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, thread_id, resource_id, role, parts_json, created_at
                FROM messages
                WHERE thread_id = ?1 AND (?2 IS NULL OR created_at > ?2)
                ORDER BY created_at ASC, id ASC
                ",
            )?;
            let rows = stmt.query_map(
                params![thread_id, after.map(|x| x.to_rfc3339())],
                message_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn list_resource_messages(
        &self,
        resource_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, thread_id, resource_id, role, parts_json, created_at
                FROM messages
                WHERE resource_id = ?1 AND (?2 IS NULL OR created_at > ?2)
                ORDER BY created_at ASC, id ASC
                ",
            )?;
            let rows = stmt.query_map(
                params![resource_id, after.map(|x| x.to_rfc3339())],
                message_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn clear_scope(&self, scope_key: &str) -> Result<()> {
        self.with_tx(|tx| {
            let record_id = tx
                .query_row(
                    "SELECT id FROM memory_records WHERE scope_key = ?1",
                    params![scope_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(record_id) = record_id {
                tx.execute(
                    "DELETE FROM observation_chunks WHERE record_id = ?1",
                    params![record_id],
                )?;
                tx.execute(
                    "DELETE FROM memory_records WHERE id = ?1",
                    params![record_id],
                )?;
            }
            Ok(())
        })
    }
}
