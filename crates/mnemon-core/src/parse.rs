//! Recovery-oriented parsing of XML-tagged Observer/Reflector output.
//!
//! Model output is well-formed most of the time, but long generations
//! occasionally truncate or interleave tags. Parsing is accuracy-first:
//! a strict pass accepts only line-anchored, properly nested sections, and
//! a lenient pass recovers overlapping or inline tags when strict parsing
//! yields nothing usable.

use crate::xml::{escape_attribute, escape_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Strict,
    Lenient,
}

/// One parsed memory section: observations plus optional continuation hints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemorySection {
    pub observations: String,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
}

/// A per-thread section from multi-thread Observer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSection {
    pub thread_id: String,
    pub observations: String,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
}

#[derive(Debug, Clone)]
struct Tag {
    kind: TagKind,
    name: String,
    /// Byte offset of `<`.
    start: usize,
    /// Byte offset one past `>`.
    end: usize,
    /// Only whitespace precedes the tag on its line.
    line_anchored: bool,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    open_start: usize,
    body_start: usize,
    body_end: usize,
    close_end: usize,
}

const fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

fn line_anchored(text: &str, tag_start: usize) -> bool {
    let line_start = text[..tag_start].rfind('\n').map_or(0, |idx| idx + 1);
    text[line_start..tag_start]
        .bytes()
        .all(|b| b == b' ' || b == b'\t')
}

/// Finds the `>` that terminates a tag, skipping quoted attribute values.
fn tag_close_offset(bytes: &[u8], mut cursor: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    while cursor < bytes.len() {
        let byte = bytes[cursor];
        match quote {
            Some(active) if byte == active => quote = None,
            Some(_) => {}
            None if byte == b'"' || byte == b'\'' => quote = Some(byte),
            None if byte == b'>' => return Some(cursor),
            None => {}
        }
        cursor += 1;
    }
    None
}

fn scan_tags(text: &str) -> Vec<Tag> {
    let bytes = text.as_bytes();
    let mut tags = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if bytes[offset] != b'<' {
            offset += 1;
            continue;
        }
        let Some(gt) = tag_close_offset(bytes, offset + 1) else {
            break;
        };
        let inner = text[offset + 1..gt].trim_start();
        let (kind, name_part) = match inner.strip_prefix('/') {
            Some(rest) => (TagKind::Close, rest.trim_start()),
            None => (TagKind::Open, inner),
        };
        let name_len = name_part
            .bytes()
            .take_while(|b| is_name_byte(*b))
            .count();
        if name_len > 0 {
            tags.push(Tag {
                kind,
                name: name_part[..name_len].to_ascii_lowercase(),
                start: offset,
                end: gt + 1,
                line_anchored: line_anchored(text, offset),
            });
        }
        offset = gt + 1;
    }
    tags
}

fn sections_for(text: &str, tags: &[Tag], name: &str, mode: ParseMode) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut open: Option<&Tag> = None;
    let mut skip_next_close = false;

    for tag in tags.iter().filter(|t| t.name == name) {
        match tag.kind {
            TagKind::Open => {
                if !tag.line_anchored {
                    continue;
                }
                match mode {
                    // Overlapping opens are ambiguous; strict parsing drops
                    // the whole malformed block.
                    ParseMode::Strict if open.is_some() => {
                        open = None;
                        skip_next_close = true;
                    }
                    // Lenient parsing re-anchors on the latest open.
                    _ => open = Some(tag),
                }
            }
            TagKind::Close => {
                if skip_next_close {
                    skip_next_close = false;
                    continue;
                }
                let Some(open_tag) = open else { continue };
                if tag.start < open_tag.end {
                    continue;
                }
                let same_line = !text[open_tag.end..tag.start].contains('\n');
                if !tag.line_anchored && !same_line {
                    continue;
                }
                sections.push(Section {
                    open_start: open_tag.start,
                    body_start: open_tag.end,
                    body_end: tag.start,
                    close_end: tag.end,
                });
                open = None;
            }
        }
    }
    sections
}

fn join_bodies(text: &str, sections: &[Section]) -> String {
    let mut joined = String::new();
    for section in sections {
        let body = text[section.body_start..section.body_end].trim();
        if body.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push('\n');
        }
        joined.push_str(body);
    }
    joined
}

fn last_nonempty_body(text: &str, sections: &[Section]) -> Option<String> {
    sections
        .iter()
        .rev()
        .map(|s| text[s.body_start..s.body_end].trim())
        .find(|body| !body.is_empty())
        .map(ToString::to_string)
}

/// Removes every `name` section from `text`, returning the stripped text and
/// the last non-empty section body.
fn take_sections(text: &str, name: &str, mode: ParseMode) -> (String, Option<String>) {
    let tags = scan_tags(text);
    let sections = sections_for(text, &tags, name, mode);
    if sections.is_empty() {
        return (text.trim().to_string(), None);
    }
    let last = last_nonempty_body(text, &sections);

    let mut stripped = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for section in &sections {
        if section.open_start < cursor {
            continue;
        }
        stripped.push_str(&text[cursor..section.open_start]);
        cursor = section.close_end;
    }
    stripped.push_str(&text[cursor..]);
    (stripped.trim().to_string(), last)
}

fn is_numbered_item(trimmed: &str) -> bool {
    let digits = trimmed.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && trimmed[digits..].starts_with(". ")
}

/// Fallback when no `<observations>` block exists: keep only list items so
/// surrounding prose never leaks into memory.
pub fn extract_list_items(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ") || trimmed.starts_with("* ") || is_numbered_item(trimmed)
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn parse_memory_section_with(content: &str, mode: ParseMode) -> MemorySection {
    let tags = scan_tags(content);
    let observation_sections = sections_for(content, &tags, "observations", mode);
    let observations = if observation_sections.is_empty() {
        extract_list_items(content)
    } else {
        join_bodies(content, &observation_sections)
    };
    let current_task = last_nonempty_body(
        content,
        &sections_for(content, &tags, "current-task", mode),
    );
    let suggested_response = last_nonempty_body(
        content,
        &sections_for(content, &tags, "suggested-response", mode),
    );
    MemorySection {
        observations: observations.trim().to_string(),
        current_task,
        suggested_response,
    }
}

/// Strict first; lenient only when strict yields no observation text.
#[must_use]
pub fn parse_memory_section(content: &str) -> MemorySection {
    let strict = parse_memory_section_with(content, ParseMode::Strict);
    if !strict.observations.is_empty() {
        return strict;
    }
    let lenient = parse_memory_section_with(content, ParseMode::Lenient);
    if lenient.observations.is_empty()
        && (strict.current_task.is_some() || strict.suggested_response.is_some())
    {
        strict
    } else {
        lenient
    }
}

fn parse_id_attribute(open_tag: &str) -> Option<String> {
    let inner = open_tag.strip_prefix('<')?.strip_suffix('>')?;
    let mut rest = inner.trim_start();
    rest = rest.trim_start_matches(|c: char| c.is_ascii() && is_name_byte(c as u8));

    while !rest.is_empty() {
        rest = rest.trim_start();
        let name_len = rest
            .bytes()
            .take_while(|b| is_name_byte(*b) || *b == b'_')
            .count();
        if name_len == 0 {
            rest = &rest[1.min(rest.len())..];
            continue;
        }
        let name = rest[..name_len].to_ascii_lowercase();
        rest = rest[name_len..].trim_start();
        let Some(after_eq) = rest.strip_prefix('=') else {
            continue;
        };
        let after_eq = after_eq.trim_start();
        let (value, remaining) = match after_eq.as_bytes().first() {
            Some(&quote @ (b'"' | b'\'')) => {
                let quote = quote as char;
                let body = &after_eq[1..];
                match body.find(quote) {
                    Some(end) => (&body[..end], &body[end + 1..]),
                    None => (body, ""),
                }
            }
            _ => {
                let end = after_eq
                    .find(char::is_whitespace)
                    .unwrap_or(after_eq.len());
                (&after_eq[..end], &after_eq[end..])
            }
        };
        if name == "id" {
            return Some(value.to_string());
        }
        rest = remaining;
    }
    None
}

fn thread_blocks(text: &str, mode: ParseMode) -> Vec<(String, String)> {
    let tags = scan_tags(text);
    let mut blocks = Vec::new();
    for section in sections_for(text, &tags, "thread", mode) {
        let open_tag = &text[section.open_start..section.body_start];
        let thread_id = parse_id_attribute(open_tag).unwrap_or_default();
        let body = text[section.body_start..section.body_end].trim().to_string();
        blocks.push((thread_id, body));
    }
    blocks
}

fn parse_thread_sections_with(content: &str, mode: ParseMode) -> Vec<ThreadSection> {
    let tags = scan_tags(content);
    let observation_sections = sections_for(content, &tags, "observations", mode);
    let scopes: Vec<&str> = if observation_sections.is_empty() {
        vec![content]
    } else {
        observation_sections
            .iter()
            .map(|s| &content[s.body_start..s.body_end])
            .collect()
    };

    let mut out = Vec::new();
    for scope in scopes {
        for (thread_id, body) in thread_blocks(scope, mode) {
            let thread_id = thread_id.trim().to_string();
            if thread_id.is_empty() {
                continue;
            }
            let (without_task, current_task) = take_sections(&body, "current-task", mode);
            let (observations, suggested_response) =
                take_sections(&without_task, "suggested-response", mode);
            out.push(ThreadSection {
                thread_id,
                observations,
                current_task,
                suggested_response,
            });
        }
    }
    out
}

/// Multi-thread Observer output: one `<thread id=...>` section per input
/// thread, nested inside `<observations>`. Accuracy-first like
/// [`parse_memory_section`].
#[must_use]
pub fn parse_multi_thread_output(content: &str) -> Vec<ThreadSection> {
    let strict = parse_thread_sections_with(content, ParseMode::Strict);
    if strict.iter().any(|s| !s.observations.trim().is_empty()) {
        return strict;
    }
    let lenient = parse_thread_sections_with(content, ParseMode::Lenient);
    if lenient.iter().any(|s| !s.observations.trim().is_empty()) || lenient.len() > strict.len() {
        lenient
    } else {
        strict
    }
}

/// Splits text organized as `<thread id=...>` blocks into `(id, body)`
/// pairs, or `None` when the text carries no thread sections.
#[must_use]
pub fn split_thread_blocks(text: &str) -> Option<Vec<(String, String)>> {
    let blocks: Vec<(String, String)> = thread_blocks(text, ParseMode::Lenient)
        .into_iter()
        .filter(|(id, _)| !id.trim().is_empty())
        .collect();
    if blocks.is_empty() { None } else { Some(blocks) }
}

/// Thread-scope sanitization: the Observer must not emit thread attribution
/// in single-thread mode, so any `<thread>` wrapper it produced is unwrapped
/// in place, keeping the body text.
#[must_use]
pub fn strip_thread_tags(text: &str) -> String {
    let tags = scan_tags(text);
    let sections = sections_for(text, &tags, "thread", ParseMode::Lenient);
    if sections.is_empty() {
        return text.trim().to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for section in &sections {
        if section.open_start < cursor {
            continue;
        }
        out.push_str(&text[cursor..section.open_start]);
        out.push_str(text[section.body_start..section.body_end].trim());
        cursor = section.close_end;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// Resource-scope aggregation: wraps each thread's observation text back
/// into a `<thread id=...>` block, preserving input order.
pub fn wrap_thread_sections(sections: &[ThreadSection]) -> String {
    sections
        .iter()
        .filter_map(|section| {
            let thread_id = section.thread_id.trim();
            let observations = section.observations.trim();
            if thread_id.is_empty() || observations.is_empty() {
                return None;
            }
            Some(format!(
                "<thread id=\"{}\">\n{}\n</thread>",
                escape_attribute(thread_id),
                escape_text(observations)
            ))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_section_parses_strict() {
        let content = "\
preamble
<observations>
* 🔴 (14:30) User prefers direct answers
</observations>
<current-task>
Ship feature X
</current-task>
<suggested-response>
Confirm rollout window
</suggested-response>";
        let section = parse_memory_section(content);
        assert_eq!(section.observations, "* 🔴 (14:30) User prefers direct answers");
        assert_eq!(section.current_task.as_deref(), Some("Ship feature X"));
        assert_eq!(
            section.suggested_response.as_deref(),
            Some("Confirm rollout window")
        );
    }

    #[test]
    fn missing_observation_tags_fall_back_to_list_items() {
        let content = "Here is what I noticed:\n* fact one\nsome prose\n- fact two";
        let section = parse_memory_section(content);
        assert_eq!(section.observations, "* fact one\n- fact two");
    }

    #[test]
    fn lenient_mode_recovers_inline_tags() {
        let content = "<observations>* inline fact</observations>";
        let section = parse_memory_section(content);
        assert_eq!(section.observations, "* inline fact");
    }

    #[test]
    fn multi_thread_output_splits_by_thread_id() {
        let content = "\
<observations>
<thread id=\"t-1\">
* fact in t1
<current-task>task one</current-task>
</thread>
<thread id=\"t-2\">
* fact in t2
</thread>
</observations>";
        let sections = parse_multi_thread_output(content);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].thread_id, "t-1");
        assert_eq!(sections[0].observations, "* fact in t1");
        assert_eq!(sections[0].current_task.as_deref(), Some("task one"));
        assert_eq!(sections[1].thread_id, "t-2");
        assert_eq!(sections[1].observations, "* fact in t2");
    }

    #[test]
    fn thread_block_without_id_is_dropped() {
        let content = "<observations>\n<thread>\n* orphan\n</thread>\n</observations>";
        assert!(parse_multi_thread_output(content).is_empty());
    }

    #[test]
    fn strip_thread_tags_unwraps_body() {
        let content = "<thread id=\"t-9\">\n* wrapped fact\n</thread>";
        assert_eq!(strip_thread_tags(content), "* wrapped fact");
    }

    #[test]
    fn wrap_thread_sections_preserves_order_and_escapes() {
        let sections = vec![
            ThreadSection {
                thread_id: "a".into(),
                observations: "* one".into(),
                current_task: None,
                suggested_response: None,
            },
            ThreadSection {
                thread_id: "b\"x".into(),
                observations: "* two < three".into(),
                current_task: None,
                suggested_response: None,
            },
        ];
        let wrapped = wrap_thread_sections(&sections);
        assert!(wrapped.starts_with("<thread id=\"a\">"));
        assert!(wrapped.contains("<thread id=\"b&quot;x\">"));
        assert!(wrapped.contains("* two &lt; three"));
    }

    #[test]
    fn quoted_attribute_values_may_contain_gt() {
        let content = "<observations>\n<thread id=\"a>b\">\n* fact\n</thread>\n</observations>";
        let sections = parse_multi_thread_output(content);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].thread_id, "a>b");
    }
}
