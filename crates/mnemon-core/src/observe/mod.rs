mod activation;
mod candidates;
mod context;
mod decision;
mod reflection;

pub use activation::{
    ActivationBoundary, merge_observation_texts, normalize_buffer_boundary,
    select_activation_boundary,
};
pub use candidates::{
    ScoredMessage, filter_unobserved_messages, greedy_threshold_batch, partition_covered_parts,
};
pub use context::{build_other_conversation_blocks, obscure_thread_id};
pub use decision::{
    BufferIntervalState, ObserverDecision, decide_observer_action, evaluate_buffer_interval,
    should_skip_continuation_hints, should_trigger_observer,
};
pub use reflection::{
    ReflectionAction, merge_buffered_reflection, observation_line_count, select_reflection_action,
    should_trigger_reflector, validate_reflection_compression,
};
