mod formatter;
mod system;
mod user;

/// Inputs for a single-thread Observer prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverPromptInput<'a> {
    pub existing_observations: Option<&'a str>,
    pub message_history: &'a str,
    pub other_conversation_context: Option<&'a str>,
    pub skip_continuation_hints: bool,
}

/// Inputs for a Reflector prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectorPromptInput<'a> {
    pub observations: &'a str,
    pub guidance: Option<&'a str>,
    pub compression_level: u8,
    pub target_tokens: u32,
}

/// One thread's pre-formatted history for the multi-thread Observer prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessages {
    pub thread_id: String,
    pub message_history: String,
}

pub use formatter::{format_messages_for_prompt, format_thread_messages_for_prompt};
pub use system::{
    build_multi_thread_observer_system_prompt, build_observer_system_prompt,
    build_reflector_system_prompt,
};
pub use user::{
    build_multi_thread_observer_user_prompt, build_observer_user_prompt,
    build_reflector_user_prompt, compression_directive,
};
