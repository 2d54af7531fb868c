use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    MemoryRecord, MemoryScope, Message, ObservationChunk, Thread, ThreadMemoryMetadata,
};

mod sqlite;
#[cfg(test)]
mod tests;

pub use sqlite::SqliteMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInit<'a> {
    pub scope: MemoryScope,
    pub scope_key: &'a str,
    pub thread_id: Option<&'a str>,
    pub resource_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveObservationsUpdate<'a> {
    pub record_id: &'a str,
    pub observations: &'a str,
    pub token_count: u32,
    pub pending_message_tokens: u32,
    pub last_observed_at: DateTime<Utc>,
    /// Union of prior observed ids and the batch just observed.
    pub observed_message_ids: &'a [String],
    pub current_task: Option<&'a str>,
    pub suggested_response: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedReflectionUpdate<'a> {
    pub record_id: &'a str,
    pub reflection: &'a str,
    pub token_count: u32,
    pub reflected_observation_line_count: u32,
}

/// Result of one buffered-observation activation swap.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSwap {
    pub record: MemoryRecord,
    pub activated_cycle_ids: Vec<String>,
    pub chunks_activated: usize,
    pub message_tokens_activated: u32,
    pub observation_tokens_activated: u32,
    pub messages_activated: u32,
    pub activated_message_ids: Vec<String>,
    /// The observation text moved active by this swap.
    pub observations: String,
}

/// Storage capability consumed by the engine: record + chunk CRUD with
/// atomic flag toggles and the buffered→active swap protocol, plus the
/// thread/message surface the scheduler reads and writes.
///
/// Field updates must be atomic with respect to flag inspection; the swap
/// operations are transactional.
pub trait MemoryStore: Send + Sync {
    fn get_record(&self, scope_key: &str) -> Result<Option<MemoryRecord>>;

    /// Creates the record on first use; returns the existing row otherwise.
    fn initialize_record(&self, init: RecordInit<'_>) -> Result<MemoryRecord>;

    fn update_active_observations(&self, update: ActiveObservationsUpdate<'_>) -> Result<()>;

    /// Persists the live pending-token tally between observations.
    fn update_pending_tokens(&self, record_id: &str, pending_message_tokens: u32) -> Result<()>;

    /// Appends one buffered chunk; existing chunks are never overwritten.
    fn append_buffered_chunk(&self, chunk: &ObservationChunk) -> Result<()>;

    fn list_buffered_chunks(&self, record_id: &str) -> Result<Vec<ObservationChunk>>;

    fn update_buffered_reflection(&self, update: BufferedReflectionUpdate<'_>) -> Result<()>;

    /// Atomically activates the chunk prefix selected by `activation_ratio`,
    /// merging its text into the active observations. Returns `None` when no
    /// chunks are buffered.
    fn swap_buffered_to_active(
        &self,
        record_id: &str,
        activation_ratio: f32,
    ) -> Result<Option<ActivationSwap>>;

    /// Replaces the reflected line prefix with the buffered reflection,
    /// appends unreflected lines verbatim, clears the buffer, and increments
    /// the generation count. `token_count` is the caller's count of the
    /// merged text. Returns `None` when no reflection is buffered.
    fn swap_buffered_reflection_to_active(
        &self,
        record_id: &str,
        token_count: u32,
    ) -> Result<Option<MemoryRecord>>;

    /// Synchronous reflection: replaces the active observations outright and
    /// increments the generation count.
    fn create_reflection_generation(
        &self,
        record_id: &str,
        reflection: &str,
        token_count: u32,
        current_task: Option<&str>,
        suggested_response: Option<&str>,
    ) -> Result<MemoryRecord>;

    fn set_observing_flag(&self, record_id: &str, on: bool) -> Result<()>;

    fn set_reflecting_flag(&self, record_id: &str, on: bool) -> Result<()>;

    /// `boundary` persists the pending-token count at which this buffering
    /// run started, so interval tracking survives restarts.
    fn set_buffering_observation_flag(
        &self,
        record_id: &str,
        on: bool,
        boundary: Option<u32>,
    ) -> Result<()>;

    fn set_buffering_reflection_flag(&self, record_id: &str, on: bool) -> Result<()>;

    fn record_trigger(&self, record_id: &str, role: crate::error::InferenceRole) -> Result<()>;

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;

    fn upsert_thread(&self, thread: &Thread) -> Result<()>;

    fn list_threads_by_resource(&self, resource_id: &str) -> Result<Vec<Thread>>;

    fn update_thread_memory(&self, thread_id: &str, memory: &ThreadMemoryMetadata) -> Result<()>;

    /// Upserts by message id, ordered by `created_at` on read.
    fn save_messages(&self, messages: &[Message]) -> Result<()>;

    fn list_thread_messages(
        &self,
        thread_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    fn list_resource_messages(
        &self,
        resource_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Destroys the record and its buffered chunks. Messages and threads
    /// survive; only the memory is forgotten.
    fn clear_scope(&self, scope_key: &str) -> Result<()>;
}
