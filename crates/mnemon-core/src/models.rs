use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::marker::MarkerPart;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Thread,
    Resource,
}

impl MemoryScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Resource => "resource",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "thread" => Some(Self::Thread),
            "resource" => Some(Self::Resource),
            _ => None,
        }
    }
}

/// Memory provenance: `initial` until the first reflection generation lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    Initial,
    Reflection,
}

impl OriginType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Reflection => "reflection",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initial" => Some(Self::Initial),
            "reflection" => Some(Self::Reflection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePartKind {
    Text {
        text: String,
    },
    ToolCall {
        tool_name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_name: String,
        result: serde_json::Value,
    },
    /// Engine-emitted boundary marker (observation / buffering / activation).
    Marker(MarkerPart),
    Other {
        kind: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartMetadata {
    #[serde(default)]
    pub sealed: bool,
    /// Monotonic seal stamp. Never mutated once persisted; later streaming
    /// content for the same logical message must land in a new message row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(flatten)]
    pub kind: MessagePartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PartMetadata>,
}

impl MessagePart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessagePartKind::Text { text: text.into() },
            metadata: None,
        }
    }

    #[must_use]
    pub fn marker(marker: MarkerPart) -> Self {
        Self {
            kind: MessagePartKind::Marker(marker),
            metadata: None,
        }
    }

    #[must_use]
    pub fn other(kind: impl Into<String>) -> Self {
        Self {
            kind: MessagePartKind::Other { kind: kind.into() },
            metadata: None,
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.metadata.is_some_and(|meta| meta.sealed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        role: MessageRole,
        parts: Vec<MessagePart>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            resource_id: None,
            role,
            parts,
            created_at,
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Concatenated textual payload, used for prompts and token estimates.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            let fragment = match &part.kind {
                MessagePartKind::Text { text } => text.clone(),
                MessagePartKind::ToolCall { tool_name, args } => {
                    format!("[tool-call {tool_name}] {args}")
                }
                MessagePartKind::ToolResult { tool_name, result } => {
                    format!("[tool-result {tool_name}] {result}")
                }
                MessagePartKind::Marker(_) | MessagePartKind::Other { .. } => continue,
            };
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&fragment);
        }
        out
    }

    /// Stamps the seal on the final part, fixing the observation boundary.
    pub fn seal_tail(&mut self, sealed_at: DateTime<Utc>) {
        if let Some(last) = self.parts.last_mut() {
            let meta = last.metadata.get_or_insert_with(PartMetadata::default);
            meta.sealed = true;
            if meta.sealed_at.is_none() {
                meta.sealed_at = Some(sealed_at);
            }
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.parts.last().is_some_and(MessagePart::is_sealed)
    }
}

/// Per-thread memory cursor and continuation hints. In resource scope these
/// cursors are authoritative for what each thread has observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThreadMemoryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub memory: ThreadMemoryMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One memory record per `(scope, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "record persists independent observer/reflector/buffer states as normalized columns"
)]
pub struct MemoryRecord {
    pub id: String,
    pub scope: MemoryScope,
    pub scope_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub origin_type: OriginType,
    pub active_observations: String,
    pub observation_token_count: u32,
    /// Tokens of messages seen but not yet persisted.
    pub pending_message_tokens: u32,
    /// High-water observation cursor. Authoritative for thread scope,
    /// advisory for resource scope (per-thread cursors live on the thread).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_at: Option<DateTime<Utc>>,
    /// Guards against re-observing messages that share a `created_at` with
    /// the cursor; the timestamp alone cannot disambiguate them.
    #[serde(default)]
    pub observed_message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    pub is_observing: bool,
    pub is_reflecting: bool,
    pub is_buffering_observation: bool,
    pub is_buffering_reflection: bool,
    /// Pending-token count at which the last buffering run started.
    pub last_buffered_at_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffered_reflection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffered_reflection_tokens: Option<u32>,
    /// Lines of `active_observations` the buffered reflection summarizes;
    /// lines past this index are appended verbatim at activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflected_observation_line_count: Option<u32>,
    pub generation_count: u32,
    #[serde(default)]
    pub observer_trigger_count_total: u32,
    #[serde(default)]
    pub reflector_trigger_count_total: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    #[must_use]
    pub fn has_buffered_reflection(&self) -> bool {
        self.buffered_reflection
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
    }
}

/// Background observer output awaiting activation. Chunks are append-only
/// and activated as an ordered prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationChunk {
    pub id: String,
    pub record_id: String,
    pub seq: u32,
    pub cycle_id: String,
    pub observations: String,
    pub token_count: u32,
    pub message_tokens: u32,
    pub message_ids: Vec<String>,
    pub last_observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Diagnostic record-shape checks used by tests and debugging surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordInvariantViolation {
    ObserverAndReflectorBothActive,
    TokenCountMismatch { stored: u32, counted: u32 },
}

pub fn validate_record_invariants(
    record: &MemoryRecord,
    counted_observation_tokens: u32,
) -> Vec<RecordInvariantViolation> {
    let mut violations = Vec::new();
    if record.is_observing && record.is_reflecting {
        violations.push(RecordInvariantViolation::ObserverAndReflectorBothActive);
    }
    if record.observation_token_count != counted_observation_tokens {
        violations.push(RecordInvariantViolation::TokenCountMismatch {
            stored: record.observation_token_count,
            counted: counted_observation_tokens,
        });
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn seal_tail_stamps_last_part_once() {
        let first = Utc::now();
        let mut message = Message::new(
            "m",
            "t",
            MessageRole::Assistant,
            vec![MessagePart::text("a"), MessagePart::text("b")],
            first,
        );
        message.seal_tail(first);
        let later = first + chrono::Duration::seconds(5);
        message.seal_tail(later);

        assert!(!message.parts[0].is_sealed());
        assert!(message.parts[1].is_sealed());
        assert_eq!(message.parts[1].metadata.unwrap().sealed_at, Some(first));
    }

    #[test]
    fn message_text_skips_marker_and_opaque_parts() {
        let mut message = Message::new(
            "m",
            "t",
            MessageRole::User,
            vec![MessagePart::text("hello")],
            Utc::now(),
        );
        message.parts.push(MessagePart::other("image"));
        assert_eq!(message.text(), "hello");
    }

    #[test]
    fn invariant_validation_flags_dual_active_roles() {
        let now = Utc::now();
        let record = MemoryRecord {
            id: "r".into(),
            scope: MemoryScope::Thread,
            scope_key: "thread:t".into(),
            thread_id: Some("t".into()),
            resource_id: None,
            origin_type: OriginType::Initial,
            active_observations: String::new(),
            observation_token_count: 0,
            pending_message_tokens: 0,
            last_observed_at: None,
            observed_message_ids: Vec::new(),
            current_task: None,
            suggested_response: None,
            is_observing: true,
            is_reflecting: true,
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
        let violations = validate_record_invariants(&record, 0);
        assert_eq!(
            violations,
            vec![RecordInvariantViolation::ObserverAndReflectorBothActive]
        );
    }
}
