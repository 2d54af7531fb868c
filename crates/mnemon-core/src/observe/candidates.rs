use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::marker::find_last_completed_observation_boundary;
use crate::models::Message;

/// A message paired with its token cost, used for budgeted batch selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    pub message: Message,
    pub tokens: u32,
}

/// Drops messages already covered by the cursor or the observed-id set.
/// Equality with the cursor counts as observed; the id set exists precisely
/// because timestamps alone cannot break that tie.
#[must_use]
pub fn filter_unobserved_messages(
    messages: &[Message],
    observed_message_ids: &HashSet<String>,
    last_observed_at: Option<DateTime<Utc>>,
) -> Vec<Message> {
    messages
        .iter()
        .filter(|message| {
            if observed_message_ids.contains(&message.id) {
                return false;
            }
            match last_observed_at {
                Some(cursor) => message.created_at > cursor,
                None => true,
            }
        })
        .cloned()
        .collect()
}

/// Greedy resource-scope batch: prefer the token-heaviest tails until the
/// threshold is covered, then restore oldest-first order for stability.
#[must_use]
pub fn greedy_threshold_batch(
    mut scored: Vec<ScoredMessage>,
    threshold: u32,
) -> Vec<ScoredMessage> {
    scored.sort_by(|a, b| {
        b.tokens
            .cmp(&a.tokens)
            .then_with(|| a.message.created_at.cmp(&b.message.created_at))
            .then_with(|| a.message.id.cmp(&b.message.id))
    });

    let mut selected = Vec::<ScoredMessage>::new();
    let mut accumulated = 0u32;
    for item in scored {
        if accumulated >= threshold && !selected.is_empty() {
            break;
        }
        accumulated = accumulated.saturating_add(item.tokens);
        selected.push(item);
    }

    selected.sort_by(|a, b| {
        a.message
            .created_at
            .cmp(&b.message.created_at)
            .then_with(|| a.message.id.cmp(&b.message.id))
    });
    selected
}

/// Step-0 cleanup split: messages fully covered by a completed observation
/// boundary (or by the record's cursor + observed-id set) are removed from
/// the outgoing list.
#[must_use]
pub fn partition_covered_parts(
    messages: Vec<Message>,
    observed_message_ids: &HashSet<String>,
    last_observed_at: Option<DateTime<Utc>>,
    has_prior_activation: bool,
) -> (Vec<Message>, Vec<Message>) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();

    for message in messages {
        if let Some(boundary) = find_last_completed_observation_boundary(&message) {
            if boundary + 1 >= message.parts.len() {
                removed.push(message);
            } else {
                // Parts after the boundary are not covered yet; keep only
                // the uncovered tail.
                let mut tail = message.clone();
                tail.parts = message.parts[boundary + 1..].to_vec();
                removed.push(message);
                kept.push(tail);
            }
            continue;
        }
        let covered_by_record = has_prior_activation
            && (observed_message_ids.contains(&message.id)
                || last_observed_at.is_some_and(|cursor| message.created_at <= cursor));
        if covered_by_record {
            removed.push(message);
        } else {
            kept.push(message);
        }
    }

    (kept, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessagePart, MessageRole};
    use chrono::Duration;

    fn message(id: &str, created_at: DateTime<Utc>) -> Message {
        Message::new(
            id,
            "t",
            MessageRole::User,
            vec![MessagePart::text("x")],
            created_at,
        )
    }

    #[test]
    fn cursor_equality_counts_as_observed() {
        let now = Utc::now();
        let messages = vec![message("a", now), message("b", now + Duration::seconds(1))];
        let kept = filter_unobserved_messages(&messages, &HashSet::new(), Some(now));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");
    }

    #[test]
    fn observed_ids_filter_same_timestamp_messages() {
        let now = Utc::now();
        let messages = vec![message("a", now), message("b", now)];
        let observed: HashSet<String> = ["a".to_string()].into();
        let kept = filter_unobserved_messages(&messages, &observed, None);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");
    }

    #[test]
    fn greedy_batch_prefers_heavy_messages_then_restores_order() {
        let base = Utc::now();
        let scored = vec![
            ScoredMessage {
                message: message("old-light", base),
                tokens: 10,
            },
            ScoredMessage {
                message: message("mid-heavy", base + Duration::seconds(1)),
                tokens: 100,
            },
            ScoredMessage {
                message: message("new-heavy", base + Duration::seconds(2)),
                tokens: 90,
            },
        ];
        let batch = greedy_threshold_batch(scored, 150);
        assert_eq!(
            batch.iter().map(|s| s.message.id.as_str()).collect::<Vec<_>>(),
            vec!["mid-heavy", "new-heavy"]
        );
    }

    #[test]
    fn greedy_batch_with_zero_threshold_takes_one() {
        let scored = vec![ScoredMessage {
            message: message("only", Utc::now()),
            tokens: 5,
        }];
        assert_eq!(greedy_threshold_batch(scored, 0).len(), 1);
    }
}
