use super::{ObserverPromptInput, ReflectorPromptInput, ThreadMessages};
use super::formatter::format_thread_messages_for_prompt;

const NO_CONTINUATION_HINT_SECTIONS: &str = "IMPORTANT: Do NOT include <current-task> or <suggested-response> sections in your output. Only output <observations>.";
const PREVIOUS_OBSERVATIONS_NOTE: &str =
    "\n\n---\n\nDo not repeat these existing observations. New observations will be appended.\n\n";

fn nonempty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn build_observer_user_prompt(input: ObserverPromptInput<'_>) -> String {
    let mut prompt = String::new();

    if let Some(existing) = nonempty(input.existing_observations) {
        prompt.push_str("## Previous Observations\n\n");
        prompt.push_str(existing);
        prompt.push_str(PREVIOUS_OBSERVATIONS_NOTE);
    }

    prompt.push_str("## New Message History to Observe\n\n");
    prompt.push_str(input.message_history.trim());
    prompt.push_str("\n\n---\n\n");

    if let Some(other_context) = nonempty(input.other_conversation_context) {
        prompt.push_str("## Other Conversation Context\n\n");
        prompt.push_str(other_context);
        prompt.push_str("\n\n---\n\n");
    }

    prompt.push_str("## Your Task\n\n");
    prompt.push_str(
        "Extract new observations from the message history. Keep observations factual and concise, and do not duplicate previous observations.",
    );
    if input.skip_continuation_hints {
        prompt.push_str("\n\n");
        prompt.push_str(NO_CONTINUATION_HINT_SECTIONS);
    }

    prompt
}

pub fn build_multi_thread_observer_user_prompt(
    existing_observations: Option<&str>,
    threads: &[ThreadMessages],
    skip_continuation_hints: bool,
) -> String {
    let mut prompt = String::new();

    if let Some(existing) = nonempty(existing_observations) {
        prompt.push_str("## Previous Observations\n\n");
        prompt.push_str(existing);
        prompt.push_str(PREVIOUS_OBSERVATIONS_NOTE);
    }

    let formatted = format_thread_messages_for_prompt(threads);
    prompt.push_str("## New Message History to Observe\n\n");
    if formatted.is_empty() {
        prompt.push_str("No thread messages provided.");
    } else {
        prompt.push_str(
            "The following messages come from multiple conversation threads. Each thread is wrapped in a <thread id=\"...\"> tag.\n\n",
        );
        prompt.push_str(&formatted);
    }
    prompt.push_str("\n\n---\n\n## Your Task\n\n");
    prompt.push_str(
        "Extract new observations for each thread. Group the output by thread using <thread id=\"...\"> blocks inside <observations>.\n\n",
    );
    prompt.push_str("Example output format:\n");
    prompt.push_str("<observations>\n<thread id=\"thread-1\">\nDate: Dec 4, 2025\n* 🔴 (14:30) User prefers direct answers\n<current-task>Working on feature X</current-task>\n<suggested-response>Continue with the implementation</suggested-response>\n</thread>\n</observations>");
    if skip_continuation_hints {
        prompt.push_str("\n\n");
        prompt.push_str(NO_CONTINUATION_HINT_SECTIONS);
    }

    prompt
}

/// Escalating compression directive used on reflection retries after an
/// oversized first pass.
#[must_use]
pub fn compression_directive(level: u8) -> &'static str {
    match level.min(2) {
        1 => {
            "## COMPRESSION REQUIRED

Your previous reflection was the same size or larger than the original observations.

Re-process with more compression:
- Towards the beginning, condense more observations into higher-level reflections.
- Closer to the end, retain finer detail (recent context matters more).
- Combine related items, but do not lose specific names, places, events, or people.
- A long run of repeated tool calls can collapse into one line stating the tool, the reason, and the final outcome.

Your previous detail level was 10/10; aim for 8/10."
        }
        2 => {
            "## AGGRESSIVE COMPRESSION REQUIRED

Your previous reflection was still too large after compression guidance.

Re-process with much more aggressive compression:
- Heavily condense older observations into high-level summaries.
- Retain fine detail only near the end (recent context matters more).
- Merge overlapping observations and remove redundant information, keeping specific names, places, events, and people.

Your previous detail level was 10/10; aim for 6/10."
        }
        _ => "",
    }
}

pub fn build_reflector_user_prompt(input: ReflectorPromptInput<'_>) -> String {
    let mut prompt = format!(
        "## OBSERVATIONS TO REFLECT ON\n\n{}\n\n---\n\nAnalyze these observations and produce a refined, condensed version that will become the assistant's entire memory going forward. Target at most {} tokens.",
        input.observations.trim(),
        input.target_tokens
    );

    if let Some(guidance) = nonempty(input.guidance) {
        prompt.push_str("\n\n## SPECIFIC GUIDANCE\n\n");
        prompt.push_str(guidance);
    }

    let directive = compression_directive(input.compression_level);
    if !directive.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(directive);
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_prompt_includes_existing_observations_once() {
        let prompt = build_observer_user_prompt(ObserverPromptInput {
            existing_observations: Some("* old fact"),
            message_history: "**User:**\nhello",
            other_conversation_context: None,
            skip_continuation_hints: false,
        });
        assert!(prompt.contains("## Previous Observations"));
        assert!(prompt.contains("* old fact"));
        assert!(prompt.contains("## New Message History to Observe"));
        assert!(!prompt.contains("Other Conversation Context"));
    }

    #[test]
    fn skip_hints_adds_suppression_directive() {
        let prompt = build_observer_user_prompt(ObserverPromptInput {
            existing_observations: None,
            message_history: "**User:**\nhello",
            other_conversation_context: None,
            skip_continuation_hints: true,
        });
        assert!(prompt.contains("Do NOT include <current-task>"));
    }

    #[test]
    fn reflector_prompt_carries_target_and_guidance() {
        let prompt = build_reflector_user_prompt(ReflectorPromptInput {
            observations: "* a\n* b",
            guidance: Some("keep project names"),
            compression_level: 1,
            target_tokens: 500,
        });
        assert!(prompt.contains("at most 500 tokens"));
        assert!(prompt.contains("keep project names"));
        assert!(prompt.contains("COMPRESSION REQUIRED"));
    }

    #[test]
    fn compression_directive_escalates_and_saturates() {
        assert!(compression_directive(0).is_empty());
        assert!(compression_directive(1).contains("8/10"));
        assert!(compression_directive(2).contains("AGGRESSIVE"));
        assert_eq!(compression_directive(9), compression_directive(2));
    }
}
