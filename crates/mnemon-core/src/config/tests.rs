use super::*;
use crate::models::MemoryScope;

fn base_options() -> MemoryEngineOptions {
    MemoryEngineOptions {
        scope: MemoryScope::Thread,
        ..MemoryEngineOptions::default()
    }
}

#[test]
fn defaults_resolve_without_async_buffering() {
    let resolved = resolve_engine_config(&base_options()).unwrap();
    assert_eq!(
        resolved.observation.message_tokens_base,
        DEFAULT_MESSAGE_TOKENS
    );
    assert_eq!(resolved.observation.total_budget, None);
    assert_eq!(resolved.observation.buffer_every, None);
    assert_eq!(resolved.observation.async_activation, None);
    assert_eq!(resolved.observation.block_after, None);
    assert_eq!(
        resolved.reflection.observation_tokens,
        DEFAULT_REFLECTION_TOKENS
    );
    assert_eq!(resolved.reflection.async_activation, None);
}

#[test]
fn fractional_buffer_every_resolves_against_base() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(0.4);
    let resolved = resolve_engine_config(&options).unwrap();
    assert_eq!(resolved.observation.buffer_every, Some(40));
    assert_eq!(
        resolved.observation.async_activation,
        Some(DEFAULT_OBSERVATION_ACTIVATION)
    );
    assert_eq!(
        resolved.reflection.async_activation,
        Some(DEFAULT_REFLECTION_ACTIVATION)
    );
    // Default block_after is a fraction above the threshold.
    assert_eq!(resolved.observation.block_after, Some(120));
}

#[test]
fn absolute_buffer_every_at_threshold_is_rejected() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(100.0);
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::BufferEveryAtOrAboveThreshold
    );
}

#[test]
fn block_after_without_buffer_every_is_rejected() {
    let mut options = base_options();
    options.observation.block_after = Some(1.5);
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::BlockAfterWithoutBufferEvery
    );
}

#[test]
fn block_after_at_or_below_threshold_is_rejected() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(40.0);
    options.observation.block_after = Some(100.0);
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::BlockAfterAtOrBelowThreshold
    );
}

#[test]
fn activation_outside_unit_interval_is_rejected() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(40.0);
    options.observation.async_activation = Some(ActivationInput::Ratio(1.2));
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::InvalidAsyncActivation
    );
}

#[test]
fn async_observation_requires_async_reflection() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.observation.buffer_every = Some(40.0);
    options.reflection.async_activation = Some(ActivationInput::Disabled);
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::ObservationAsyncRequiresReflectionAsync
    );
}

#[test]
fn model_conflict_is_rejected() {
    let mut options = base_options();
    options.model = Some("m-default".into());
    options.observation.model = Some("m-observer".into());
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::ModelConflict
    );
}

#[test]
fn per_role_model_falls_back_to_top_level() {
    let mut options = base_options();
    options.model = Some("m-default".into());
    let resolved = resolve_engine_config(&options).unwrap();
    assert_eq!(resolved.observer_model.model.as_deref(), Some("m-default"));
    assert_eq!(resolved.reflector_model.model.as_deref(), Some("m-default"));
}

#[test]
fn range_threshold_requires_shared_budget() {
    let mut options = base_options();
    options.observation.message_tokens = Some(TokenThreshold::Range { min: 100, max: 500 });
    assert_eq!(
        resolve_engine_config(&options).unwrap_err(),
        ConfigError::RangeThresholdWithoutSharedBudget
    );
}

#[test]
fn shared_budget_expands_threshold_into_unused_observation_space() {
    let mut options = base_options();
    options.share_token_budget = true;
    options.observation.message_tokens = Some(TokenThreshold::Range { min: 100, max: 500 });
    let resolved = resolve_engine_config(&options).unwrap();

    assert_eq!(resolved.observation.effective_threshold(0), 500);
    assert_eq!(resolved.observation.effective_threshold(150), 350);
    // Never drops below the base budget.
    assert_eq!(resolved.observation.effective_threshold(450), 100);
}

#[test]
fn shared_budget_with_scalar_derives_range_from_reflection_span() {
    let mut options = base_options();
    options.share_token_budget = true;
    options.observation.message_tokens = Some(TokenThreshold::Fixed(100));
    options.reflection.observation_tokens = Some(TokenThreshold::Fixed(400));
    let resolved = resolve_engine_config(&options).unwrap();
    assert_eq!(resolved.observation.total_budget, Some(500));
    assert_eq!(resolved.observation.effective_threshold(380), 120);
}

#[test]
fn reflection_range_resolves_to_max() {
    let mut options = base_options();
    options.reflection.observation_tokens = Some(TokenThreshold::Range { min: 200, max: 600 });
    let resolved = resolve_engine_config(&options).unwrap();
    assert_eq!(resolved.reflection.observation_tokens, 600);
}
