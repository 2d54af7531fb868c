use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::models::{MemoryRecord, Message, MessagePart, MessageRole};

/// Fixed id of the injected observation system message; replaced in place
/// every step.
pub(crate) const OBSERVATION_MESSAGE_ID: &str = "om-injected-observations";
/// Fixed id of the synthetic continuation reminder; its epoch timestamp
/// makes it sort first among recent messages.
pub(crate) const CONTINUATION_REMINDER_ID: &str = "om-continuation-reminder";

const PREAMBLE: &str = "The following observations block contains your memory of past conversations with this user. It was written by you, for you. It is the only record you have of everything that happened before the recent messages.";

const IMPORTANT_NOTE: &str = "IMPORTANT: Treat these observations as your own memory. Do not mention the observation system to the user; simply remember.";

const KNOWLEDGE_UPDATES_NOTE: &str = "KNOWLEDGE UPDATES: When an observation contradicts an older one, the newer observation is authoritative.";

const PLANNED_ACTIONS_NOTE: &str = "PLANNED ACTIONS: If the observations record a task in progress, continue it rather than starting over.";

fn parse_date_header(line: &str) -> Option<NaiveDate> {
    let raw = line.trim().strip_prefix("Date:")?.trim();
    NaiveDate::parse_from_str(raw, "%b %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%B %d, %Y"))
        .ok()
}

fn relative_annotation(date: NaiveDate, today: NaiveDate) -> Option<String> {
    let days = (today - date).num_days();
    match days {
        0 => Some("(today)".to_string()),
        1 => Some("(yesterday)".to_string()),
        d if d > 1 => Some(format!("({d} days ago)")),
        _ => None,
    }
}

/// Annotates `Date:` headers with relative age and inserts `[N days later]`
/// separators where consecutive headers are two or more days apart.
pub(crate) fn relativize_dates(observations: &str, now: DateTime<Utc>) -> String {
    let today = now.date_naive();
    let mut out = Vec::<String>::new();
    let mut previous_date: Option<NaiveDate> = None;

    for line in observations.lines() {
        if let Some(date) = parse_date_header(line) {
            if let Some(previous) = previous_date {
                let gap = (date - previous).num_days();
                if gap >= 2 {
                    out.push(format!("[{gap} days later]"));
                }
            }
            let annotated = match relative_annotation(date, today) {
                Some(annotation) => format!("{} {annotation}", line.trim_end()),
                None => line.to_string(),
            };
            out.push(annotated);
            previous_date = Some(date);
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

/// The system message carrying active observations into the Actor's prompt.
pub(crate) fn build_observation_system_message(
    record: &MemoryRecord,
    other_conversations: Option<&str>,
    thread_id: &str,
    now: DateTime<Utc>,
) -> Message {
    let mut body = String::new();
    body.push_str(PREAMBLE);
    body.push_str("\n\n<observations>\n");
    body.push_str(&relativize_dates(record.active_observations.trim(), now));
    body.push_str("\n</observations>\n\n");
    body.push_str(IMPORTANT_NOTE);
    body.push('\n');
    body.push_str(KNOWLEDGE_UPDATES_NOTE);
    body.push('\n');
    body.push_str(PLANNED_ACTIONS_NOTE);

    if let Some(other) = other_conversations.map(str::trim).filter(|v| !v.is_empty()) {
        body.push_str("\n\nOther conversations with this user are in progress:\n\n");
        body.push_str(other);
    }
    if let Some(task) = record
        .current_task
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        body.push_str("\n\n<current-task>\n");
        body.push_str(task);
        body.push_str("\n</current-task>");
    }
    if let Some(suggested) = record
        .suggested_response
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        body.push_str("\n\n<suggested-response>\n");
        body.push_str(suggested);
        body.push_str("\n</suggested-response>");
    }

    Message::new(
        OBSERVATION_MESSAGE_ID,
        thread_id,
        MessageRole::System,
        vec![MessagePart::text(body)],
        now,
    )
}

/// Synthetic user reminder pinned to the epoch so it sorts ahead of the
/// recent messages it introduces.
pub(crate) fn build_continuation_reminder(thread_id: &str) -> Message {
    Message::new(
        CONTINUATION_REMINDER_ID,
        thread_id,
        MessageRole::User,
        vec![MessagePart::text(
            "The conversation continues from your observational memory above. The messages below are the most recent exchange.",
        )],
        Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now),
    )
}

/// Engine-injected synthetic messages are never persisted or observed.
pub(crate) fn is_injected_message(message: &Message) -> bool {
    message.id == OBSERVATION_MESSAGE_ID || message.id == CONTINUATION_REMINDER_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoryScope, OriginType};

    fn record_with(observations: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: "r".into(),
            scope: MemoryScope::Thread,
            scope_key: "thread:t".into(),
            thread_id: Some("t".into()),
            resource_id: None,
            origin_type: OriginType::Initial,
            active_observations: observations.into(),
            observation_token_count: 0,
            pending_message_tokens: 0,
            last_observed_at: None,
            observed_message_ids: Vec::new(),
            current_task: Some("finish the report".into()),
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
    fn date_headers_gain_relative_annotations() {
        let now = Utc.with_ymd_and_hms(2025, 12, 9, 12, 0, 0).unwrap();
        let text = "Date: Dec 4, 2025\n* fact";
        let rendered = relativize_dates(text, now);
        assert!(rendered.contains("Date: Dec 4, 2025 (5 days ago)"));
    }

    #[test]
    fn gaps_of_two_or_more_days_insert_separators() {
        let now = Utc.with_ymd_and_hms(2025, 12, 9, 12, 0, 0).unwrap();
        let text = "Date: Dec 1, 2025\n* a\nDate: Dec 4, 2025\n* b\nDate: Dec 5, 2025\n* c";
        let rendered = relativize_dates(text, now);
        assert!(rendered.contains("[3 days later]"));
        // One-day gap gets no separator.
        assert_eq!(rendered.matches("days later]").count(), 1);
    }

    #[test]
    fn system_message_carries_observations_and_hints() {
        let record = record_with("Date: Dec 4, 2025\n* fact");
        let message =
            build_observation_system_message(&record, Some("<other-conversation id=\"x\">\n[user] hi\n</other-conversation>"), "t", Utc::now());
        assert_eq!(message.id, OBSERVATION_MESSAGE_ID);
        assert_eq!(message.role, MessageRole::System);
        let text = message.text();
        assert!(text.contains("<observations>"));
        assert!(text.contains("* fact"));
        assert!(text.contains("KNOWLEDGE UPDATES:"));
        assert!(text.contains("<current-task>"));
        assert!(text.contains("other-conversation"));
        assert!(!text.contains("<suggested-response>"));
    }

    #[test]
    fn continuation_reminder_sorts_first() {
        let reminder = build_continuation_reminder("t");
        assert_eq!(reminder.id, CONTINUATION_REMINDER_ID);
        assert_eq!(reminder.created_at.timestamp(), 0);
        assert!(is_injected_message(&reminder));
    }
}
