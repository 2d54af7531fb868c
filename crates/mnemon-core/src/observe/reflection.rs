use crate::models::MemoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionAction {
    None,
    /// Start a background reflection against the activation target.
    Buffer,
    /// Run (or activate) a reflection now.
    Reflect,
}

#[must_use]
pub const fn should_trigger_reflector(observation_tokens: u32, threshold: u32) -> bool {
    observation_tokens > threshold
}

/// Chooses between doing nothing, buffering a reflection ahead of the
/// threshold, and reflecting now. `is_reflecting` always wins: at most one
/// reflection per record at a time.
#[must_use]
pub fn select_reflection_action(
    record: &MemoryRecord,
    reflection_threshold: u32,
    async_activation: Option<f32>,
) -> ReflectionAction {
    if record.is_reflecting {
        return ReflectionAction::None;
    }
    let threshold_reached =
        should_trigger_reflector(record.observation_token_count, reflection_threshold);

    let Some(activation) = async_activation else {
        return if threshold_reached {
            ReflectionAction::Reflect
        } else {
            ReflectionAction::None
        };
    };

    if threshold_reached {
        if record.has_buffered_reflection() {
            return ReflectionAction::Reflect;
        }
        if record.is_buffering_reflection {
            return ReflectionAction::None;
        }
        return ReflectionAction::Buffer;
    }

    if record.has_buffered_reflection() || record.is_buffering_reflection {
        return ReflectionAction::None;
    }
    let activation_point = f64::from(reflection_threshold) * f64::from(activation);
    if f64::from(record.observation_token_count) >= activation_point {
        ReflectionAction::Buffer
    } else {
        ReflectionAction::None
    }
}

/// Line count of the active observation text, the boundary a background
/// reflection covers; lines appended after the reflector was called are
/// appended verbatim at activation.
#[must_use]
pub fn observation_line_count(active_observations: &str) -> u32 {
    if active_observations.is_empty() {
        return 0;
    }
    saturating_usize_to_u32(active_observations.split('\n').count())
}

/// Replaces the reflected line prefix with the buffered reflection and
/// appends the remaining lines verbatim.
#[must_use]
pub fn merge_buffered_reflection(
    active_observations: &str,
    reflected_line_count: usize,
    buffered_reflection: &str,
) -> String {
    let reflection = buffered_reflection.trim();
    let lines: Vec<&str> = active_observations.split('\n').collect();
    if reflection.is_empty() {
        return active_observations.trim().to_string();
    }

    let split = reflected_line_count.min(lines.len());
    let unreflected = lines[split..].join("\n");
    let unreflected = unreflected.trim();
    if unreflected.is_empty() {
        reflection.to_string()
    } else {
        format!("{reflection}\n\n{unreflected}")
    }
}

/// First-pass acceptance check; a failed check triggers the retry cycle.
#[must_use]
pub const fn validate_reflection_compression(reflected_tokens: u32, target_tokens: u32) -> bool {
    reflected_tokens < target_tokens
}

fn saturating_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoryScope, OriginType};
    use chrono::Utc;

    fn record(observation_tokens: u32) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: "r".into(),
            scope: MemoryScope::Thread,
            scope_key: "thread:t".into(),
            thread_id: Some("t".into()),
            resource_id: None,
            origin_type: OriginType::Initial,
            active_observations: String::new(),
            observation_token_count: observation_tokens,
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
        }
    }

    #[test]
    fn reflection_threshold_is_strict() {
        assert!(!should_trigger_reflector(400, 400));
        assert!(should_trigger_reflector(401, 400));
    }

    #[test]
    fn sync_mode_reflects_only_past_threshold() {
        assert_eq!(
            select_reflection_action(&record(500), 400, None),
            ReflectionAction::Reflect
        );
        assert_eq!(
            select_reflection_action(&record(300), 400, None),
            ReflectionAction::None
        );
    }

    #[test]
    fn async_mode_buffers_at_activation_point() {
        // 0.5 × 400 = 200: below → none, at or above → buffer.
        assert_eq!(
            select_reflection_action(&record(199), 400, Some(0.5)),
            ReflectionAction::None
        );
        assert_eq!(
            select_reflection_action(&record(200), 400, Some(0.5)),
            ReflectionAction::Buffer
        );
    }

    #[test]
    fn buffered_reflection_activates_once_threshold_passes() {
        let mut rec = record(500);
        rec.buffered_reflection = Some("compressed".into());
        assert_eq!(
            select_reflection_action(&rec, 400, Some(0.5)),
            ReflectionAction::Reflect
        );
    }

    #[test]
    fn in_flight_reflection_blocks_everything() {
        let mut rec = record(500);
        rec.is_reflecting = true;
        assert_eq!(
            select_reflection_action(&rec, 400, Some(0.5)),
            ReflectionAction::None
        );
    }

    #[test]
    fn line_count_tracks_split_lines() {
        assert_eq!(observation_line_count(""), 0);
        assert_eq!(observation_line_count("* a"), 1);
        assert_eq!(observation_line_count("* a\n* b\n* c"), 3);
    }

    #[test]
    fn merge_replaces_prefix_and_appends_tail_verbatim() {
        let active = "* a\n* b\n* c";
        let merged = merge_buffered_reflection(active, 2, "* compressed");
        assert_eq!(merged, "* compressed\n\n* c");

        let merged_all = merge_buffered_reflection(active, 3, "* compressed");
        assert_eq!(merged_all, "* compressed");
    }

    #[test]
    fn compression_validation_is_strict() {
        assert!(validate_reflection_compression(99, 100));
        assert!(!validate_reflection_compression(100, 100));
    }
}
