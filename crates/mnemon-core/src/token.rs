use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::models::{Message, MessagePartKind};

/// Flat per-message overhead covering role framing tokens.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;
/// Flat per-part overhead covering part framing tokens.
const PART_OVERHEAD_TOKENS: u32 = 3;
/// Parts with no textual payload (markers, attachments) count as a constant.
const OPAQUE_PART_TOKENS: u32 = 10;

/// Deterministic token accounting over the fixed cl100k_base BPE table.
///
/// One counter is built per engine instance; the encoder table is immutable
/// and shared by reference thereafter.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        // The cl100k table is compiled into the binary; construction only
        // fails if the embedded vocabulary is corrupt.
        let bpe = cl100k_base().expect("embedded cl100k_base table must load");
        Self { bpe }
    }

    #[must_use]
    pub fn count_text(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        saturating_usize_to_u32(self.bpe.encode_ordinary(text).len())
    }

    #[must_use]
    pub fn count_message(&self, message: &Message) -> u32 {
        let mut total = MESSAGE_OVERHEAD_TOKENS;
        for part in &message.parts {
            total = total.saturating_add(PART_OVERHEAD_TOKENS);
            let part_tokens = match &part.kind {
                MessagePartKind::Text { text } => self.count_text(text),
                MessagePartKind::ToolCall { tool_name, args } => self
                    .count_text(tool_name)
                    .saturating_add(self.count_json(args)),
                MessagePartKind::ToolResult { tool_name, result } => self
                    .count_text(tool_name)
                    .saturating_add(self.count_json(result)),
                MessagePartKind::Marker(_) | MessagePartKind::Other { .. } => OPAQUE_PART_TOKENS,
            };
            total = total.saturating_add(part_tokens);
        }
        total
    }

    #[must_use]
    pub fn count_messages(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .fold(0u32, |sum, m| sum.saturating_add(self.count_message(m)))
    }

    fn count_json(&self, value: &serde_json::Value) -> u32 {
        match serde_json::to_string(value) {
            Ok(serialized) => self.count_text(&serialized),
            Err(_) => 0,
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap char-based bound used only where an exact count would require
/// re-encoding inside a tight prompt-assembly loop.
#[must_use]
pub fn approximate_text_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    if chars == 0 { 0 } else { chars.div_ceil(4) }
}

fn saturating_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessagePart, MessageRole};
    use chrono::Utc;

    fn text_message(text: &str) -> Message {
        Message::new(
            "m-1",
            "t-1",
            MessageRole::User,
            vec![MessagePart::text(text)],
            Utc::now(),
        )
    }

    #[test]
    fn empty_string_counts_zero() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count_text(""), 0);
    }

    #[test]
    fn message_count_includes_role_and_part_overhead() {
        let counter = TokenCounter::new();
        let message = text_message("hello world");
        let text_tokens = counter.count_text("hello world");
        assert_eq!(counter.count_message(&message), 4 + 3 + text_tokens);
    }

    #[test]
    fn opaque_parts_count_flat() {
        let counter = TokenCounter::new();
        let mut message = text_message("hi");
        message.parts.push(MessagePart::other("file-attachment"));
        let text_tokens = counter.count_text("hi");
        assert_eq!(counter.count_message(&message), 4 + 3 + text_tokens + 3 + 10);
    }

    #[test]
    fn collection_count_is_sum_of_members() {
        let counter = TokenCounter::new();
        let a = text_message("first message");
        let b = text_message("second, rather longer message body");
        assert_eq!(
            counter.count_messages(&[a.clone(), b.clone()]),
            counter.count_message(&a) + counter.count_message(&b)
        );
    }

    #[test]
    fn approximate_tokens_rounds_up() {
        assert_eq!(approximate_text_tokens(""), 0);
        assert_eq!(approximate_text_tokens("abcd"), 1);
        assert_eq!(approximate_text_tokens("abcde"), 2);
    }
}
