mod input;
mod resolve;
mod validate;

pub const DEFAULT_MESSAGE_TOKENS: u32 = 30_000;
pub const DEFAULT_REFLECTION_TOKENS: u32 = 40_000;
pub const DEFAULT_OBSERVATION_ACTIVATION: f32 = 0.8;
pub const DEFAULT_REFLECTION_ACTIVATION: f32 = 0.5;
pub const DEFAULT_BLOCK_AFTER_FRACTION: f64 = 0.2;
pub const DEFAULT_MAX_TOKENS_PER_BATCH: u32 = 10_000;

pub use input::{
    ActivationInput, MemoryEngineOptions, ModelSettings, ObservationOptions, ReflectionOptions,
    TokenThreshold,
};
pub use resolve::{
    ResolvedEngineConfig, ResolvedObservationConfig, ResolvedReflectionConfig, ResolvedRoleModel,
    resolve_engine_config,
};
pub use validate::ConfigError;

#[cfg(test)]
mod tests;
