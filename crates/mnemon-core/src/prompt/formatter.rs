use crate::models::Message;
use crate::xml::{escape_attribute, escape_text};

use super::ThreadMessages;

fn display_role(role: &str) -> String {
    let mut chars = role.trim().chars();
    let Some(first) = chars.next() else {
        return "Unknown".to_string();
    };
    let mut out = first.to_uppercase().collect::<String>();
    out.push_str(chars.as_str());
    out
}

fn format_timestamp(value: chrono::DateTime<chrono::Utc>) -> String {
    value.format("%b %-d, %Y, %-I:%M %p").to_string()
}

/// Renders messages as `**Role (timestamp):**` blocks separated by rules,
/// oldest first.
#[must_use]
pub fn format_messages_for_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|message| {
            let text = message.text();
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let role = display_role(message.role.as_str());
            let timestamp = format_timestamp(message.created_at);
            Some(format!("**{role} ({timestamp}):**\n{text}"))
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Wraps each thread's formatted history in a `<thread id=...>` block for
/// the multi-thread Observer prompt.
#[must_use]
pub fn format_thread_messages_for_prompt(threads: &[ThreadMessages]) -> String {
    threads
        .iter()
        .filter_map(|thread| {
            let thread_id = thread.thread_id.trim();
            let history = thread.message_history.trim();
            if thread_id.is_empty() || history.is_empty() {
                return None;
            }
            Some(format!(
                "<thread id=\"{}\">\n{}\n</thread>",
                escape_attribute(thread_id),
                escape_text(history)
            ))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
