use crate::models::ObservationChunk;
use crate::parse::split_thread_blocks;

/// The chunk prefix selected for one activation event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivationBoundary {
    pub chunks_activated: usize,
    pub activated_cycle_ids: Vec<String>,
    pub message_tokens_activated: u32,
    pub observation_tokens_activated: u32,
    pub messages_activated: u32,
    pub activated_message_ids: Vec<String>,
}

/// Selects the shortest chunk prefix whose cumulative observation tokens
/// reach `activation_ratio` of the buffered total. At least one chunk is
/// activated whenever any chunk exists.
#[must_use]
pub fn select_activation_boundary(
    chunks: &[ObservationChunk],
    activation_ratio: f32,
) -> ActivationBoundary {
    if chunks.is_empty() {
        return ActivationBoundary::default();
    }
    let ratio = f64::from(activation_ratio.clamp(0.0, 1.0));
    let total: u64 = chunks.iter().map(|c| u64::from(c.token_count)).sum();
    let target = total_target(total, ratio);

    let mut cumulative: u64 = 0;
    let mut boundary = chunks.len();
    for (idx, chunk) in chunks.iter().enumerate() {
        cumulative = cumulative.saturating_add(u64::from(chunk.token_count));
        if cumulative >= target {
            boundary = idx + 1;
            break;
        }
    }
    let boundary = boundary.max(1);
    let activated = &chunks[..boundary];

    ActivationBoundary {
        chunks_activated: boundary,
        activated_cycle_ids: activated.iter().map(|c| c.cycle_id.clone()).collect(),
        message_tokens_activated: sum_u32(activated.iter().map(|c| c.message_tokens)),
        observation_tokens_activated: sum_u32(activated.iter().map(|c| c.token_count)),
        messages_activated: saturating_usize_to_u32(
            activated.iter().map(|c| c.message_ids.len()).sum::<usize>(),
        ),
        activated_message_ids: activated
            .iter()
            .flat_map(|c| c.message_ids.iter().cloned())
            .collect(),
    }
}

fn total_target(total: u64, ratio: f64) -> u64 {
    let value = (total as f64) * ratio;
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is non-negative finite and bounded by the u64 token total"
    )]
    {
        value.ceil() as u64
    }
}

/// Persisted interval boundary can never exceed the live pending count
/// (pending tokens shrink when observations land).
#[must_use]
pub fn normalize_buffer_boundary(current_tokens: u32, last_buffered_at_tokens: u32) -> u32 {
    last_buffered_at_tokens.min(current_tokens)
}

fn last_date_header(text: &str) -> Option<&str> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("Date: "))
}

/// Joins two observation bodies, dropping a leading date header in the
/// addition when it repeats the last header already present.
fn join_dedup_dates(existing: &str, addition: &str) -> String {
    let existing = existing.trim();
    let addition = addition.trim();
    if existing.is_empty() {
        return addition.to_string();
    }
    if addition.is_empty() {
        return existing.to_string();
    }
    let deduped = match (last_date_header(existing), addition.lines().next()) {
        (Some(header), Some(first)) if first.trim() == header => addition
            .lines()
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        _ => addition.to_string(),
    };
    if deduped.is_empty() {
        existing.to_string()
    } else {
        format!("{existing}\n{deduped}")
    }
}

fn rebuild_thread_blocks(blocks: &[(String, String)]) -> String {
    blocks
        .iter()
        .filter(|(_, body)| !body.trim().is_empty())
        .map(|(id, body)| format!("<thread id=\"{id}\">\n{}\n</thread>", body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Appends newly activated (or newly observed) text onto the active
/// observations. When both sides are organized as `<thread>` sections the
/// merge is per-thread, combining matching date sections; otherwise the
/// addition is appended in order.
#[must_use]
pub fn merge_observation_texts(active: &str, addition: &str) -> String {
    let active_trimmed = active.trim();
    let addition_trimmed = addition.trim();
    if active_trimmed.is_empty() {
        return addition_trimmed.to_string();
    }
    if addition_trimmed.is_empty() {
        return active_trimmed.to_string();
    }

    if let (Some(existing_blocks), Some(new_blocks)) = (
        split_thread_blocks(active_trimmed),
        split_thread_blocks(addition_trimmed),
    ) {
        let mut merged: Vec<(String, String)> = existing_blocks;
        for (thread_id, body) in new_blocks {
            match merged.iter_mut().find(|(id, _)| *id == thread_id) {
                Some((_, existing_body)) => {
                    *existing_body = join_dedup_dates(existing_body, &body);
                }
                None => merged.push((thread_id, body)),
            }
        }
        return rebuild_thread_blocks(&merged);
    }

    format!(
        "{active_trimmed}\n\n{}",
        join_dedup_dates("", addition_trimmed)
    )
}

fn sum_u32(values: impl Iterator<Item = u32>) -> u32 {
    values.fold(0u32, |sum, v| sum.saturating_add(v))
}

fn saturating_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(cycle: &str, tokens: u32, message_tokens: u32, ids: &[&str]) -> ObservationChunk {
        ObservationChunk {
            id: format!("chunk-{cycle}"),
            record_id: "rec".into(),
            seq: 0,
            cycle_id: cycle.into(),
            observations: format!("* from {cycle}"),
            token_count: tokens,
            message_tokens,
            message_ids: ids.iter().map(ToString::to_string).collect(),
            last_observed_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_buffer_selects_nothing() {
        assert_eq!(
            select_activation_boundary(&[], 0.7),
            ActivationBoundary::default()
        );
    }

    #[test]
    fn boundary_covers_requested_ratio_of_observation_tokens() {
        let chunks = vec![
            chunk("a", 50, 100, &["m1"]),
            chunk("b", 30, 80, &["m2", "m3"]),
            chunk("c", 20, 60, &["m4"]),
        ];
        let boundary = select_activation_boundary(&chunks, 0.7);
        // 70% of 100 tokens needs the first two chunks (50 + 30).
        assert_eq!(boundary.chunks_activated, 2);
        assert_eq!(boundary.activated_cycle_ids, vec!["a", "b"]);
        assert_eq!(boundary.observation_tokens_activated, 80);
        assert_eq!(boundary.message_tokens_activated, 180);
        assert_eq!(boundary.messages_activated, 3);
    }

    #[test]
    fn full_ratio_activates_everything() {
        let chunks = vec![chunk("a", 10, 5, &["m1"]), chunk("b", 10, 5, &["m2"])];
        let boundary = select_activation_boundary(&chunks, 1.0);
        assert_eq!(boundary.chunks_activated, 2);
    }

    #[test]
    fn at_least_one_chunk_activates() {
        let chunks = vec![chunk("a", 0, 5, &["m1"]), chunk("b", 100, 5, &["m2"])];
        let boundary = select_activation_boundary(&chunks, 0.01);
        assert!(boundary.chunks_activated >= 1);
    }

    #[test]
    fn plain_merge_appends_in_order() {
        let merged = merge_observation_texts("* old", "* new");
        assert_eq!(merged, "* old\n\n* new");
    }

    #[test]
    fn merge_combines_matching_thread_sections() {
        let active = "<thread id=\"t1\">\nDate: Dec 4, 2025\n* one\n</thread>";
        let addition = "<thread id=\"t1\">\nDate: Dec 4, 2025\n* two\n</thread>\n\n<thread id=\"t2\">\n* other\n</thread>";
        let merged = merge_observation_texts(active, addition);
        assert_eq!(merged.matches("<thread id=\"t1\">").count(), 1);
        assert_eq!(merged.matches("Date: Dec 4, 2025").count(), 1);
        assert!(merged.contains("* one\n* two"));
        assert!(merged.contains("<thread id=\"t2\">"));
    }

    #[test]
    fn buffer_boundary_never_exceeds_current() {
        assert_eq!(normalize_buffer_boundary(100, 40), 40);
        assert_eq!(normalize_buffer_boundary(30, 40), 30);
    }
}
