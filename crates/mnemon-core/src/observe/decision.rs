use crate::config::ResolvedObservationConfig;
use crate::models::MemoryRecord;

/// State of the background-buffering interval tracker for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferIntervalState {
    pub interval_tokens: Option<u32>,
    pub crossed_interval_boundary: bool,
    pub new_tokens_since_last_boundary: u32,
    pub min_new_tokens_required: u32,
    pub should_trigger: bool,
}

#[must_use]
pub const fn should_trigger_observer(total_pending: u32, threshold: u32) -> bool {
    total_pending >= threshold
}

/// Buffering fires when the pending-token count crosses a multiple of the
/// interval, debounced so a run covering fewer than half an interval of
/// fresh tokens is skipped.
#[must_use]
pub fn evaluate_buffer_interval(
    current_tokens: u32,
    buffer_every: Option<u32>,
    last_buffered_at_tokens: u32,
) -> BufferIntervalState {
    let Some(interval_tokens) = buffer_every.filter(|value| *value > 0) else {
        return BufferIntervalState {
            interval_tokens: None,
            crossed_interval_boundary: false,
            new_tokens_since_last_boundary: 0,
            min_new_tokens_required: 0,
            should_trigger: false,
        };
    };

    let crossed_interval_boundary =
        current_tokens / interval_tokens > last_buffered_at_tokens / interval_tokens;
    let new_tokens_since_last_boundary = current_tokens.saturating_sub(last_buffered_at_tokens);
    let min_new_tokens_required = (interval_tokens / 2).max(1);
    let should_trigger =
        crossed_interval_boundary && new_tokens_since_last_boundary >= min_new_tokens_required;

    BufferIntervalState {
        interval_tokens: Some(interval_tokens),
        crossed_interval_boundary,
        new_tokens_since_last_boundary,
        min_new_tokens_required,
        should_trigger,
    }
}

/// Truth table driving the threshold branch of the per-step scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverDecision {
    pub threshold: u32,
    pub threshold_reached: bool,
    pub interval_triggered: bool,
    pub block_after_exceeded: bool,
}

#[must_use]
pub fn decide_observer_action(
    record: &MemoryRecord,
    total_pending_tokens: u32,
    config: &ResolvedObservationConfig,
) -> ObserverDecision {
    let threshold = config.effective_threshold(record.observation_token_count);
    let threshold_reached = should_trigger_observer(total_pending_tokens, threshold);
    // A stale boundary above the live tally means observations landed since
    // the last buffering run; clamp so interval math stays monotonic.
    let last_buffered = super::activation::normalize_buffer_boundary(
        total_pending_tokens,
        record.last_buffered_at_tokens,
    );
    let interval_state =
        evaluate_buffer_interval(total_pending_tokens, config.buffer_every, last_buffered);
    // Past the threshold the debounce is dropped so buffering can catch up.
    let interval_triggered = if threshold_reached {
        interval_state.crossed_interval_boundary
    } else {
        interval_state.should_trigger
    };
    let block_after_exceeded = config
        .block_after
        .is_some_and(|limit| total_pending_tokens >= limit);

    ObserverDecision {
        threshold,
        threshold_reached,
        interval_triggered,
        block_after_exceeded,
    }
}

/// Interval-only observation runs skip `<current-task>` /
/// `<suggested-response>`: those hints only matter when the result is about
/// to be injected.
#[must_use]
pub const fn should_skip_continuation_hints(decision: ObserverDecision) -> bool {
    decision.interval_triggered && !decision.threshold_reached
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_triggers_only_after_boundary_and_debounce() {
        let state = evaluate_buffer_interval(39, Some(40), 0);
        assert!(!state.crossed_interval_boundary);
        assert!(!state.should_trigger);

        let state = evaluate_buffer_interval(41, Some(40), 0);
        assert!(state.crossed_interval_boundary);
        assert!(state.should_trigger);

        // Boundary crossed but almost all tokens already buffered.
        let state = evaluate_buffer_interval(81, Some(40), 70);
        assert!(state.crossed_interval_boundary);
        assert!(!state.should_trigger);
    }

    #[test]
    fn interval_disabled_without_buffer_every() {
        let state = evaluate_buffer_interval(500, None, 0);
        assert_eq!(state.interval_tokens, None);
        assert!(!state.should_trigger);
    }

    #[test]
    fn threshold_trigger_is_inclusive() {
        assert!(!should_trigger_observer(99, 100));
        assert!(should_trigger_observer(100, 100));
    }
}
