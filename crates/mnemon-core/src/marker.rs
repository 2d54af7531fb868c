use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{MemoryScope, Message, MessagePartKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Observation,
    Reflection,
}

impl OperationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Reflection => "reflection",
        }
    }
}

/// Threshold snapshot attached to markers so the UI can render progress
/// against the budget that was in force when the cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub message_tokens: u32,
    pub observation_tokens: u32,
    pub scope: MemoryScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStartMarker {
    pub cycle_id: String,
    pub operation_type: OperationType,
    pub started_at: DateTime<Utc>,
    pub tokens_to_observe: u32,
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub thread_ids: Vec<String>,
    pub config: MarkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEndMarker {
    pub cycle_id: String,
    pub operation_type: OperationType,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tokens_observed: u32,
    pub observation_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleFailedMarker {
    pub cycle_id: String,
    pub operation_type: OperationType,
    pub failed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tokens_attempted: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationMarker {
    pub cycle_id: String,
    pub chunks_activated: u32,
    pub tokens_activated: u32,
    pub observation_tokens: u32,
    pub messages_activated: u32,
    pub config: MarkerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub pending_tokens: u32,
    pub message_tokens: u32,
    pub message_tokens_percent: f32,
    pub observation_tokens: u32,
    pub observation_tokens_threshold: u32,
    pub observation_tokens_percent: f32,
    pub will_observe: bool,
    pub buffered_chunks_count: u32,
    pub buffered_message_tokens: u32,
    pub buffered_observation_tokens: u32,
    pub has_buffered_chunks: bool,
    pub step_number: u32,
}

/// Boundary data parts appended to the tail of messages. A `cycle_id` links
/// `start` to exactly one of `end` | `failed` for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "marker", rename_all = "kebab-case")]
pub enum MarkerPart {
    ObservationStart(CycleStartMarker),
    ObservationEnd(CycleEndMarker),
    ObservationFailed(CycleFailedMarker),
    BufferingStart(CycleStartMarker),
    BufferingEnd(CycleEndMarker),
    BufferingFailed(CycleFailedMarker),
    Activation(ActivationMarker),
    Progress(ProgressMarker),
}

impl MarkerPart {
    #[must_use]
    pub fn cycle_id(&self) -> Option<&str> {
        match self {
            Self::ObservationStart(m) | Self::BufferingStart(m) => Some(&m.cycle_id),
            Self::ObservationEnd(m) | Self::BufferingEnd(m) => Some(&m.cycle_id),
            Self::ObservationFailed(m) | Self::BufferingFailed(m) => Some(&m.cycle_id),
            Self::Activation(m) => Some(&m.cycle_id),
            Self::Progress(_) => None,
        }
    }
}

#[must_use]
pub fn new_cycle_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn serialize_marker(marker: &MarkerPart) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(marker)?)
}

pub fn parse_marker(value: &serde_json::Value) -> Result<MarkerPart> {
    Ok(serde_json::from_value(value.clone())?)
}

/// Index of the most recent `observation-end` part, if any. Parts at or
/// before this index are covered by a completed observation.
#[must_use]
pub fn find_last_completed_observation_boundary(message: &Message) -> Option<usize> {
    message
        .parts
        .iter()
        .rposition(|part| matches!(&part.kind, MessagePartKind::Marker(MarkerPart::ObservationEnd(_))))
}

/// True iff the most recent `observation-start` is not yet resolved by a
/// later `observation-end` or `observation-failed`.
#[must_use]
pub fn has_in_progress_observation(message: &Message) -> bool {
    let last_start = message.parts.iter().rposition(|part| {
        matches!(
            &part.kind,
            MessagePartKind::Marker(MarkerPart::ObservationStart(_))
        )
    });
    let Some(last_start) = last_start else {
        return false;
    };
    let last_resolved = message.parts.iter().rposition(|part| {
        matches!(
            &part.kind,
            MessagePartKind::Marker(
                MarkerPart::ObservationEnd(_) | MarkerPart::ObservationFailed(_)
            )
        )
    });
    match last_resolved {
        Some(resolved) => last_start > resolved,
        None => true,
    }
}

/// Appends an `observation-end` marker to the host message and seals its
/// tail, fixing the boundary against later streaming mutation.
pub fn append_observation_end(message: &mut Message, marker: CycleEndMarker) {
    let completed_at = marker.completed_at;
    message
        .parts
        .push(crate::models::MessagePart::marker(MarkerPart::ObservationEnd(marker)));
    message.seal_tail(completed_at);
}
