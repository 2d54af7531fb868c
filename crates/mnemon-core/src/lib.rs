// Public fallible APIs in this crate share one concrete error contract
// (`MnemonError`). Repeating per-function `# Errors` boilerplate would
// obscure behavior more than it clarifies.
#![allow(
    clippy::missing_errors_doc,
    reason = "crate-wide fallible API uses one explicit error type"
)]

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod marker;
pub mod models;
pub(crate) mod observe;
pub mod parse;
pub(crate) mod prompt;
pub mod store;
pub mod stream;
pub mod token;
pub(crate) mod xml;

pub use agent::{AgentCall, AgentCallRequest, AgentReply, AgentUsage, HttpAgentClient};
pub use config::{
    ActivationInput, ConfigError, MemoryEngineOptions, ModelSettings, ObservationOptions,
    ReflectionOptions, ResolvedEngineConfig, TokenThreshold,
};
pub use engine::{
    AbortSignal, InputStepArgs, MemoryEngine, OutputResultArgs, ProcessedStep, TurnState,
    build_scope_key,
};
pub use error::{InferenceFailureKind, InferenceRole, MnemonError, Result};
pub use events::{DebugEvent, DebugEventSink};
pub use marker::{MarkerPart, OperationType};
pub use models::{
    MemoryRecord, MemoryScope, Message, MessagePart, MessagePartKind, MessageRole,
    ObservationChunk, OriginType, RecordInvariantViolation, Thread, ThreadMemoryMetadata,
    validate_record_invariants,
};
pub use store::{MemoryStore, SqliteMemoryStore};
pub use stream::{CollectingStreamWriter, NullStreamWriter, StreamWriter};
pub use token::TokenCounter;
