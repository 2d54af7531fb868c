use thiserror::Error;

use super::input::TokenThreshold;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid observation.message_tokens: must be > 0")]
    InvalidObservationMessageTokens,
    #[error("invalid observation.message_tokens range: requires 0 < min < max")]
    InvalidObservationThresholdRange,
    #[error("observation.message_tokens range requires share_token_budget")]
    RangeThresholdWithoutSharedBudget,
    #[error("invalid reflection.observation_tokens: must be > 0")]
    InvalidReflectionObservationTokens,
    #[error("model must be set either at the top level or per role, not both")]
    ModelConflict,
    #[error("invalid observation.buffer_every: must be a positive finite number")]
    InvalidBufferEvery,
    #[error("observation.buffer_every must resolve below the message threshold")]
    BufferEveryAtOrAboveThreshold,
    #[error("invalid async_activation: must be in (0, 1]")]
    InvalidAsyncActivation,
    #[error("observation.async_activation cannot be disabled while buffer_every is set")]
    ActivationDisabledWithBuffering,
    #[error("observation.block_after requires observation.buffer_every")]
    BlockAfterWithoutBufferEvery,
    #[error("observation.block_after must resolve above the message threshold")]
    BlockAfterAtOrBelowThreshold,
    #[error("invalid observation.max_tokens_per_batch: must be > 0")]
    InvalidMaxTokensPerBatch,
    #[error("async observation requires async reflection; reflection.async_activation is disabled")]
    ObservationAsyncRequiresReflectionAsync,
}

pub(super) fn validate_message_threshold(
    threshold: TokenThreshold,
    share_token_budget: bool,
) -> Result<(), ConfigError> {
    match threshold {
        TokenThreshold::Fixed(value) => {
            if value == 0 {
                return Err(ConfigError::InvalidObservationMessageTokens);
            }
        }
        TokenThreshold::Range { min, max } => {
            if !share_token_budget {
                return Err(ConfigError::RangeThresholdWithoutSharedBudget);
            }
            if min == 0 || min >= max {
                return Err(ConfigError::InvalidObservationThresholdRange);
            }
        }
    }
    Ok(())
}

pub(super) fn validate_reflection_threshold(threshold: TokenThreshold) -> Result<u32, ConfigError> {
    let resolved = match threshold {
        TokenThreshold::Fixed(value) => value,
        // A shared budget caps the reflection target at the full observation
        // span, so the range resolves to its max.
        TokenThreshold::Range { min, max } => {
            if min == 0 || min >= max {
                return Err(ConfigError::InvalidReflectionObservationTokens);
            }
            max
        }
    };
    if resolved == 0 {
        return Err(ConfigError::InvalidReflectionObservationTokens);
    }
    Ok(resolved)
}

pub(super) fn validate_activation_ratio(ratio: f32) -> Result<f32, ConfigError> {
    if !ratio.is_finite() || !(ratio > 0.0 && ratio <= 1.0) {
        return Err(ConfigError::InvalidAsyncActivation);
    }
    Ok(ratio)
}

/// Fraction in (0, 1) resolves against `base`; values >= 1 are absolute.
pub(super) fn resolve_buffer_every(raw: f64, base_threshold: u32) -> Result<u32, ConfigError> {
    if !raw.is_finite() || raw <= 0.0 {
        return Err(ConfigError::InvalidBufferEvery);
    }
    let resolved = if raw < 1.0 {
        round_f64_to_u32(f64::from(base_threshold) * raw).ok_or(ConfigError::InvalidBufferEvery)?
    } else {
        round_f64_to_u32(raw).ok_or(ConfigError::InvalidBufferEvery)?
    };
    if resolved == 0 {
        return Err(ConfigError::InvalidBufferEvery);
    }
    if resolved >= base_threshold {
        return Err(ConfigError::BufferEveryAtOrAboveThreshold);
    }
    Ok(resolved)
}

/// Fraction in (0, 1) is "fraction above the threshold"; values >= 1 are
/// absolute tokens.
pub(super) fn resolve_block_after(raw: f64, base_threshold: u32) -> Result<u32, ConfigError> {
    if !raw.is_finite() || raw <= 0.0 {
        return Err(ConfigError::BlockAfterAtOrBelowThreshold);
    }
    let resolved = if raw < 1.0 {
        let extra = round_f64_to_u32(f64::from(base_threshold) * raw)
            .ok_or(ConfigError::BlockAfterAtOrBelowThreshold)?;
        base_threshold.saturating_add(extra)
    } else {
        round_f64_to_u32(raw).ok_or(ConfigError::BlockAfterAtOrBelowThreshold)?
    };
    if resolved <= base_threshold {
        return Err(ConfigError::BlockAfterAtOrBelowThreshold);
    }
    Ok(resolved)
}

pub(super) const fn validate_max_tokens_per_batch(value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidMaxTokensPerBatch)
    } else {
        Ok(value)
    }
}

fn round_f64_to_u32(value: f64) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if !(0.0..=f64::from(u32::MAX)).contains(&rounded) {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is validated finite and within u32 bounds before conversion"
    )]
    {
        Some(rounded as u32)
    }
}
