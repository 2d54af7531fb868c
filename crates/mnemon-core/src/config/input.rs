use serde::{Deserialize, Serialize};

use crate::models::MemoryScope;

/// Pending-token trigger level. `Range` is the shared-budget shape: the
/// message budget expands into unused observation space down to `min`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenThreshold {
    Fixed(u32),
    Range { min: u32, max: u32 },
}

/// Activation ratio input. `Disabled` opts a role out of async buffering
/// explicitly, as opposed to merely leaving the field unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ActivationInput {
    Disabled,
    Ratio(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationOptions {
    /// Scalar threshold, or `{min,max}` when the token budget is shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_tokens: Option<TokenThreshold>,
    /// Background buffering interval; fraction of the base threshold when
    /// `< 1`, absolute tokens when `>= 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_every: Option<f64>,
    /// Fraction of buffered content moved active per activation event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_activation: Option<ActivationInput>,
    /// Pending-token level above which the engine falls back to synchronous
    /// observation even with async buffering on; fraction above the base
    /// threshold when `< 1`, absolute tokens when `>= 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_settings: Option<ModelSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReflectionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_tokens: Option<TokenThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_activation: Option<ActivationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_settings: Option<ModelSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEngineOptions {
    pub scope: MemoryScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub share_token_budget: bool,
    #[serde(default)]
    pub obscure_thread_ids: bool,
    #[serde(default)]
    pub observation: ObservationOptions,
    #[serde(default)]
    pub reflection: ReflectionOptions,
}

impl Default for MemoryEngineOptions {
    fn default() -> Self {
        Self {
            scope: MemoryScope::Thread,
            model: None,
            share_token_budget: false,
            obscure_thread_ids: false,
            observation: ObservationOptions::default(),
            reflection: ReflectionOptions::default(),
        }
    }
}
