use crate::models::MemoryScope;

use super::input::{ActivationInput, MemoryEngineOptions, ModelSettings, TokenThreshold};
use super::validate::{
    ConfigError, resolve_block_after, resolve_buffer_every, validate_activation_ratio,
    validate_max_tokens_per_batch, validate_message_threshold, validate_reflection_threshold,
};
use super::{
    DEFAULT_BLOCK_AFTER_FRACTION, DEFAULT_MAX_TOKENS_PER_BATCH, DEFAULT_MESSAGE_TOKENS,
    DEFAULT_OBSERVATION_ACTIVATION, DEFAULT_REFLECTION_ACTIVATION, DEFAULT_REFLECTION_TOKENS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoleModel {
    pub model: Option<String>,
    pub settings: ModelSettings,
    pub provider_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObservationConfig {
    /// Scalar threshold, or the `min` of the shared-budget range.
    pub message_tokens_base: u32,
    /// The `max` of the shared-budget range; `None` in scalar mode.
    pub total_budget: Option<u32>,
    pub max_tokens_per_batch: u32,
    pub buffer_every: Option<u32>,
    pub async_activation: Option<f32>,
    pub block_after: Option<u32>,
}

impl ResolvedObservationConfig {
    /// The live threshold: in shared-budget mode the message budget expands
    /// into unused observation space, never dropping below the base.
    #[must_use]
    pub fn effective_threshold(&self, current_observation_tokens: u32) -> u32 {
        match self.total_budget {
            Some(total) => total
                .saturating_sub(current_observation_tokens)
                .max(self.message_tokens_base),
            None => self.message_tokens_base,
        }
    }

    #[must_use]
    pub const fn async_enabled(&self) -> bool {
        self.buffer_every.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedReflectionConfig {
    pub observation_tokens: u32,
    pub async_activation: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEngineConfig {
    pub scope: MemoryScope,
    pub share_token_budget: bool,
    pub obscure_thread_ids: bool,
    pub observation: ResolvedObservationConfig,
    pub reflection: ResolvedReflectionConfig,
    pub observer_model: ResolvedRoleModel,
    pub reflector_model: ResolvedRoleModel,
}

fn resolve_role_model(
    top_level: Option<&str>,
    role_model: Option<&str>,
    settings: Option<ModelSettings>,
    provider_options: Option<&serde_json::Value>,
) -> ResolvedRoleModel {
    ResolvedRoleModel {
        model: role_model.or(top_level).map(ToString::to_string),
        settings: settings.unwrap_or_default(),
        provider_options: provider_options.cloned(),
    }
}

fn resolve_observation_activation(
    input: Option<ActivationInput>,
    async_enabled: bool,
) -> Result<Option<f32>, ConfigError> {
    if !async_enabled {
        return Ok(None);
    }
    match input {
        None => Ok(Some(DEFAULT_OBSERVATION_ACTIVATION)),
        Some(ActivationInput::Disabled) => Err(ConfigError::ActivationDisabledWithBuffering),
        Some(ActivationInput::Ratio(ratio)) => validate_activation_ratio(ratio).map(Some),
    }
}

fn resolve_reflection_activation(
    input: Option<ActivationInput>,
    observation_async_enabled: bool,
) -> Result<Option<f32>, ConfigError> {
    match input {
        None => Ok(observation_async_enabled.then_some(DEFAULT_REFLECTION_ACTIVATION)),
        Some(ActivationInput::Disabled) => {
            if observation_async_enabled {
                return Err(ConfigError::ObservationAsyncRequiresReflectionAsync);
            }
            Ok(None)
        }
        Some(ActivationInput::Ratio(ratio)) => validate_activation_ratio(ratio).map(Some),
    }
}

pub fn resolve_engine_config(
    options: &MemoryEngineOptions,
) -> Result<ResolvedEngineConfig, ConfigError> {
    if options.model.is_some()
        && (options.observation.model.is_some() || options.reflection.model.is_some())
    {
        return Err(ConfigError::ModelConflict);
    }

    let message_threshold = options
        .observation
        .message_tokens
        .unwrap_or(TokenThreshold::Fixed(DEFAULT_MESSAGE_TOKENS));
    validate_message_threshold(message_threshold, options.share_token_budget)?;

    let reflection_tokens = validate_reflection_threshold(
        options
            .reflection
            .observation_tokens
            .unwrap_or(TokenThreshold::Fixed(DEFAULT_REFLECTION_TOKENS)),
    )?;

    let (message_tokens_base, total_budget) = match message_threshold {
        TokenThreshold::Fixed(value) => {
            if options.share_token_budget {
                // Scalar input under a shared budget: the observation span
                // becomes the headroom above the message base.
                (value, Some(value.saturating_add(reflection_tokens)))
            } else {
                (value, None)
            }
        }
        TokenThreshold::Range { min, max } => (min, Some(max)),
    };

    let max_tokens_per_batch = validate_max_tokens_per_batch(
        options
            .observation
            .max_tokens_per_batch
            .unwrap_or(DEFAULT_MAX_TOKENS_PER_BATCH),
    )?;

    let buffer_every = options
        .observation
        .buffer_every
        .map(|raw| resolve_buffer_every(raw, message_tokens_base))
        .transpose()?;
    let async_enabled = buffer_every.is_some();

    if options.observation.block_after.is_some() && !async_enabled {
        return Err(ConfigError::BlockAfterWithoutBufferEvery);
    }
    let block_after = if async_enabled {
        let raw = options
            .observation
            .block_after
            .unwrap_or(DEFAULT_BLOCK_AFTER_FRACTION);
        Some(resolve_block_after(raw, message_tokens_base)?)
    } else {
        None
    };

    let observation_activation =
        resolve_observation_activation(options.observation.async_activation, async_enabled)?;
    let reflection_activation =
        resolve_reflection_activation(options.reflection.async_activation, async_enabled)?;

    Ok(ResolvedEngineConfig {
        scope: options.scope,
        share_token_budget: options.share_token_budget,
        obscure_thread_ids: options.obscure_thread_ids,
        observation: ResolvedObservationConfig {
            message_tokens_base,
            total_budget,
            max_tokens_per_batch,
            buffer_every,
            async_activation: observation_activation,
            block_after,
        },
        reflection: ResolvedReflectionConfig {
            observation_tokens: reflection_tokens,
            async_activation: reflection_activation,
        },
        observer_model: resolve_role_model(
            options.model.as_deref(),
            options.observation.model.as_deref(),
            options.observation.model_settings,
            options.observation.provider_options.as_ref(),
        ),
        reflector_model: resolve_role_model(
            options.model.as_deref(),
            options.reflection.model.as_deref(),
            options.reflection.model_settings,
            options.reflection.provider_options.as_ref(),
        ),
    })
}
