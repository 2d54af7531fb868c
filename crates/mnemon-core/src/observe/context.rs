use std::collections::BTreeMap;

use crate::models::Message;
use crate::xml::{escape_attribute, escape_text};

/// 32-bit FNV-1a over the thread id, rendered as fixed-width hex. Used when
/// real thread ids must not leak into cross-thread context.
#[must_use]
pub fn obscure_thread_id(thread_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in thread_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

/// Formats other threads' unobserved messages as `<other-conversation>`
/// blocks for the Observer prompt. Messages are grouped per thread, ordered
/// chronologically, and bounded per line.
#[must_use]
pub fn build_other_conversation_blocks(
    messages: &[Message],
    current_thread_id: &str,
    obscure_ids: bool,
    max_part_chars: usize,
) -> Option<String> {
    if max_part_chars == 0 {
        return None;
    }

    let mut groups = BTreeMap::<String, Vec<&Message>>::new();
    for message in messages {
        if message.thread_id == current_thread_id || message.thread_id.trim().is_empty() {
            continue;
        }
        groups
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
    }
    if groups.is_empty() {
        return None;
    }

    let mut blocks = Vec::<String>::new();
    for (thread_id, mut group) in groups {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let lines = group
            .into_iter()
            .filter_map(|message| {
                let text = message.text();
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    return None;
                }
                let bounded = text.chars().take(max_part_chars).collect::<String>();
                Some(format!(
                    "[{}] {}",
                    escape_text(message.role.as_str()),
                    escape_text(&bounded)
                ))
            })
            .collect::<Vec<_>>();
        if lines.is_empty() {
            continue;
        }
        let display_id = if obscure_ids {
            obscure_thread_id(&thread_id)
        } else {
            thread_id
        };
        blocks.push(format!(
            "<other-conversation id=\"{}\">\n{}\n</other-conversation>",
            escape_attribute(&display_id),
            lines.join("\n")
        ));
    }

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}
