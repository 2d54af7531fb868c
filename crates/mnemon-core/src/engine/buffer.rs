use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::agent::AgentCall;
use crate::config::DEFAULT_OBSERVATION_ACTIVATION;
use crate::error::Result;
use crate::events::DebugEvent;
use crate::marker::{
    ActivationMarker, CycleEndMarker, CycleFailedMarker, CycleStartMarker, MarkerPart,
    OperationType, new_cycle_id,
};
use crate::models::{MemoryRecord, Message, ObservationChunk};
use crate::observe::{filter_unobserved_messages, observation_line_count};
use crate::parse::{parse_memory_section, strip_thread_tags};
use crate::prompt::{
    ObserverPromptInput, ReflectorPromptInput, build_observer_system_prompt,
    build_observer_user_prompt, build_reflector_system_prompt, build_reflector_user_prompt,
    format_messages_for_prompt,
};
use crate::store::{ActivationSwap, BufferedReflectionUpdate, MemoryStore};
use crate::stream::StreamWriter;
use uuid::Uuid;

use super::observer::elapsed_ms;
use super::{AbortSignal, EngineInner, OpGate};

/// Bound on waiting for an in-flight buffering run before activation
/// proceeds with whatever chunks are already committed.
pub(crate) const ACTIVATION_WAIT: Duration = Duration::from_secs(60);

const BUFFERED_SEPARATOR: &str = "--- BUFFERED (pending activation) ---";

/// Observer context for a buffering run: active text plus chunks already
/// buffered but not yet activated.
fn buffered_observer_context(active: &str, chunks: &[ObservationChunk]) -> String {
    let mut pieces = Vec::<String>::new();
    let active = active.trim();
    if !active.is_empty() {
        pieces.push(active.to_string());
    }
    let buffered = chunks
        .iter()
        .map(|chunk| chunk.observations.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if !buffered.is_empty() {
        if pieces.is_empty() {
            pieces.push(buffered);
        } else {
            pieces.push(format!("{BUFFERED_SEPARATOR}\n\n{buffered}"));
        }
    }
    pieces.join("\n\n")
}

impl<S: MemoryStore, A: AgentCall> EngineInner<S, A> {
    /// True when an observation-buffering run for this scope has not yet
    /// signalled completion.
    pub(crate) fn buffering_in_flight(&self, scope_key: &str) -> bool {
        self.buffer_ops
            .lock()
            .ok()
            .and_then(|ops| ops.get(scope_key).map(|gate| !gate.is_done()))
            .unwrap_or(false)
    }

    fn take_buffer_gate(&self, scope_key: &str) -> Option<Arc<OpGate>> {
        self.buffer_ops
            .lock()
            .ok()
            .and_then(|ops| ops.get(scope_key).cloned())
    }

    /// Waits (bounded) for the scope's in-flight buffering run; activation
    /// proceeds with committed chunks on timeout.
    pub(crate) fn wait_for_buffering(&self, scope_key: &str, timeout: Duration) {
        if let Some(gate) = self.take_buffer_gate(scope_key)
            && !gate.wait(timeout)
        {
            self.events.emit(DebugEvent::BufferingSkipped {
                scope_key: scope_key.to_string(),
                reason: "activation timed out waiting for in-flight buffering",
            });
        }
    }

    /// Activates the buffered chunk prefix; each activated cycle produces
    /// one activation marker so the UI can pair it with its buffering
    /// marker. Interval tracking restarts after activation.
    pub(crate) fn activate_buffered_observations(
        &self,
        scope_key: &str,
        record_id: &str,
        writer: &dyn StreamWriter,
    ) -> Result<Option<ActivationSwap>> {
        self.wait_for_buffering(scope_key, ACTIVATION_WAIT);
        let ratio = self
            .resolved
            .observation
            .async_activation
            .unwrap_or(DEFAULT_OBSERVATION_ACTIVATION);
        let Some(swap) = self.store.swap_buffered_to_active(record_id, ratio)? else {
            return Ok(None);
        };

        if let Ok(mut boundaries) = self.last_buffered_boundary.lock() {
            boundaries.insert(scope_key.to_string(), 0);
        }
        for cycle_id in &swap.activated_cycle_ids {
            let marker = MarkerPart::Activation(ActivationMarker {
                cycle_id: cycle_id.clone(),
                chunks_activated: u32::try_from(swap.chunks_activated).unwrap_or(u32::MAX),
                tokens_activated: swap.message_tokens_activated,
                observation_tokens: swap.record.observation_token_count,
                messages_activated: swap.messages_activated,
                config: self.marker_config(),
                observations: Some(swap.observations.clone()),
            });
            self.emit_marker(writer, scope_key, &marker);
        }
        Ok(Some(swap))
    }
}

/// Kicks off one background observation-buffering run for the scope, if
/// none is in flight. Runs are serialized per scope: a new run waits for
/// its predecessor before touching the record.
pub(crate) fn spawn_observation_buffering<S, A>(
    inner: &Arc<EngineInner<S, A>>,
    scope_key: &str,
    record: &MemoryRecord,
    thread_id: &str,
    boundary_tokens: u32,
    writer: &Arc<dyn StreamWriter>,
) where
    S: MemoryStore + 'static,
    A: AgentCall + 'static,
{
    if inner.resolved.observation.buffer_every.is_none() {
        return;
    }
    // In-memory op map and the persisted flag both gate the trigger; the
    // flag covers sibling instances sharing the store, the boundary mirror
    // covers re-entry at the same token tally within this instance.
    if inner.buffering_in_flight(scope_key) || record.is_buffering_observation {
        return;
    }
    let already_buffered_here = inner
        .last_buffered_boundary
        .lock()
        .ok()
        .and_then(|boundaries| boundaries.get(scope_key).copied())
        .is_some_and(|boundary| boundary >= boundary_tokens && boundary > 0);
    if already_buffered_here {
        return;
    }
    if inner
        .store
        .set_buffering_observation_flag(&record.id, true, Some(boundary_tokens))
        .is_err()
    {
        return;
    }
    if let Ok(mut boundaries) = inner.last_buffered_boundary.lock() {
        boundaries.insert(scope_key.to_string(), boundary_tokens);
    }

    let predecessor = inner.take_buffer_gate(scope_key);
    let gate = Arc::new(OpGate::default());
    if let Ok(mut ops) = inner.buffer_ops.lock() {
        ops.insert(scope_key.to_string(), gate.clone());
    }

    let cycle_id = new_cycle_id();
    let start = MarkerPart::BufferingStart(CycleStartMarker {
        cycle_id: cycle_id.clone(),
        operation_type: OperationType::Observation,
        started_at: Utc::now(),
        tokens_to_observe: boundary_tokens.saturating_sub(record.last_buffered_at_tokens),
        record_id: record.id.clone(),
        thread_id: Some(thread_id.to_string()),
        thread_ids: vec![thread_id.to_string()],
        config: inner.marker_config(),
    });
    inner.emit_marker(writer.as_ref(), scope_key, &start);

    let inner = Arc::clone(inner);
    let writer = Arc::clone(writer);
    let scope_key = scope_key.to_string();
    let record_id = record.id.clone();
    let thread_id = thread_id.to_string();
    std::thread::spawn(move || {
        if let Some(predecessor) = predecessor {
            let _ = predecessor.wait(ACTIVATION_WAIT);
        }
        let started = Instant::now();
        let outcome = run_observation_buffering(
            &inner,
            &scope_key,
            &record_id,
            &thread_id,
            &cycle_id,
            writer.as_ref(),
            started,
        );
        if let Err(err) = outcome {
            let failed = MarkerPart::BufferingFailed(CycleFailedMarker {
                cycle_id: cycle_id.clone(),
                operation_type: OperationType::Observation,
                failed_at: Utc::now(),
                duration_ms: elapsed_ms(started),
                tokens_attempted: 0,
                error: err.to_string(),
            });
            inner.emit_marker(writer.as_ref(), &scope_key, &failed);
            inner.events.emit(DebugEvent::BackgroundError {
                scope_key: scope_key.clone(),
                error: err.to_string(),
            });
            let _ = inner
                .store
                .set_buffering_observation_flag(&record_id, false, None);
        }
        gate.finish();
    });
}

fn run_observation_buffering<S: MemoryStore, A: AgentCall>(
    inner: &EngineInner<S, A>,
    scope_key: &str,
    record_id: &str,
    thread_id: &str,
    cycle_id: &str,
    writer: &dyn StreamWriter,
    started: Instant,
) -> Result<()> {
    let Some(record) = inner.store.get_record(scope_key)? else {
        return Ok(());
    };
    let chunks = inner.store.list_buffered_chunks(record_id)?;

    // Fresh unobserved messages, excluding anything already inside a
    // buffered chunk.
    let mut covered: HashSet<String> = record.observed_message_ids.iter().cloned().collect();
    for chunk in &chunks {
        covered.extend(chunk.message_ids.iter().cloned());
    }
    let history = inner.store.list_thread_messages(thread_id, None)?;
    let mut batch = filter_unobserved_messages(&history, &covered, record.last_observed_at);
    batch.retain(|message| !message.text().trim().is_empty());
    let batch_tokens = inner.counter.count_messages(&batch);

    let min_new_tokens = inner
        .resolved
        .observation
        .buffer_every
        .map_or(1, |interval| (interval / 2).max(1));
    if batch.is_empty() || batch_tokens < min_new_tokens {
        inner.events.emit(DebugEvent::BufferingSkipped {
            scope_key: scope_key.to_string(),
            reason: "fewer than half an interval of fresh tokens",
        });
        inner
            .store
            .set_buffering_observation_flag(record_id, false, None)?;
        return Ok(());
    }

    // Seal the chosen messages before observing them, so concurrent
    // streaming lands in new messages instead of mutating these.
    let sealed_at = Utc::now();
    let mut sealed: Vec<Message> = batch.clone();
    for message in &mut sealed {
        for part in &mut message.parts {
            let meta = part.metadata.get_or_insert_with(Default::default);
            meta.sealed = true;
        }
        message.seal_tail(sealed_at);
    }
    inner.store.save_messages(&sealed)?;

    let context = buffered_observer_context(&record.active_observations, &chunks);
    let message_history = format_messages_for_prompt(&batch);
    let system_prompt = build_observer_system_prompt();
    let user_prompt = build_observer_user_prompt(ObserverPromptInput {
        existing_observations: Some(&context),
        message_history: &message_history,
        other_conversation_context: None,
        skip_continuation_hints: true,
    });
    let never_aborted = AbortSignal::new();
    let reply = inner.call_observer(&never_aborted, &system_prompt, &user_prompt)?;
    let section = parse_memory_section(&reply.text);
    let observations = strip_thread_tags(&section.observations);
    let token_count = inner.counter.count_text(&observations);
    let last_observed_at = batch
        .iter()
        .map(|m| m.created_at)
        .max()
        .unwrap_or_else(Utc::now);

    inner.store.append_buffered_chunk(&ObservationChunk {
        id: Uuid::new_v4().to_string(),
        record_id: record_id.to_string(),
        seq: 0,
        cycle_id: cycle_id.to_string(),
        observations,
        token_count,
        message_tokens: batch_tokens,
        message_ids: batch.iter().map(|m| m.id.clone()).collect(),
        last_observed_at,
        created_at: Utc::now(),
    })?;
    inner
        .store
        .set_buffering_observation_flag(record_id, false, None)?;

    let end = MarkerPart::BufferingEnd(CycleEndMarker {
        cycle_id: cycle_id.to_string(),
        operation_type: OperationType::Observation,
        completed_at: Utc::now(),
        duration_ms: elapsed_ms(started),
        tokens_observed: batch_tokens,
        observation_tokens: token_count,
        observations: None,
        current_task: None,
        suggested_response: None,
    });
    inner.emit_marker(writer, scope_key, &end);
    Ok(())
}

/// Kicks off one background reflection-buffering run: compress the current
/// observation text ahead of the reflection threshold, so crossing it later
/// costs only an activation swap.
pub(crate) fn spawn_reflection_buffering<S, A>(
    inner: &Arc<EngineInner<S, A>>,
    record: &MemoryRecord,
    scope_key: &str,
) where
    S: MemoryStore + 'static,
    A: AgentCall + 'static,
{
    let Some(activation) = inner.resolved.reflection.async_activation else {
        return;
    };
    if record.has_buffered_reflection() || record.is_buffering_reflection {
        return;
    }
    {
        let Ok(mut ops) = inner.reflection_ops.lock() else {
            return;
        };
        if !ops.insert(scope_key.to_string()) {
            return;
        }
    }
    if inner
        .store
        .set_buffering_reflection_flag(&record.id, true)
        .is_err()
    {
        if let Ok(mut ops) = inner.reflection_ops.lock() {
            ops.remove(scope_key);
        }
        return;
    }

    let cycle_id = new_cycle_id();
    if let Ok(mut cycles) = inner.reflection_buffer_cycles.lock() {
        cycles.insert(scope_key.to_string(), cycle_id.clone());
    }

    let inner = Arc::clone(inner);
    let scope_key = scope_key.to_string();
    let record_id = record.id.clone();
    let active_observations = record.active_observations.clone();
    let target_tokens = target_from_ratio(
        inner.resolved.reflection.observation_tokens,
        activation,
    );
    std::thread::spawn(move || {
        let outcome = run_reflection_buffering(
            &inner,
            &record_id,
            &active_observations,
            target_tokens,
        );
        if let Err(err) = outcome {
            inner.events.emit(DebugEvent::BackgroundError {
                scope_key: scope_key.clone(),
                error: err.to_string(),
            });
            let _ = inner.store.set_buffering_reflection_flag(&record_id, false);
        }
        if let Ok(mut ops) = inner.reflection_ops.lock() {
            ops.remove(&scope_key);
        }
    });
}

fn run_reflection_buffering<S: MemoryStore, A: AgentCall>(
    inner: &EngineInner<S, A>,
    record_id: &str,
    active_observations: &str,
    target_tokens: u32,
) -> Result<()> {
    if active_observations.trim().is_empty() {
        inner.store.set_buffering_reflection_flag(record_id, false)?;
        return Ok(());
    }
    // The line boundary is fixed at call time; later growth stays
    // unreflected and is appended verbatim at activation.
    let reflected_line_count = observation_line_count(active_observations);

    let system_prompt = build_reflector_system_prompt();
    let user_prompt = build_reflector_user_prompt(ReflectorPromptInput {
        observations: active_observations,
        guidance: None,
        compression_level: 0,
        target_tokens,
    });
    let reply = inner.agent.call(&crate::agent::AgentCallRequest {
        role: crate::error::InferenceRole::Reflector,
        model: inner.resolved.reflector_model.model.as_deref(),
        system_prompt: &system_prompt,
        user_prompt: &user_prompt,
        settings: inner.resolved.reflector_model.settings,
        provider_options: inner.resolved.reflector_model.provider_options.as_ref(),
    })?;
    let section = parse_memory_section(&reply.text);
    if section.observations.trim().is_empty() {
        inner.store.set_buffering_reflection_flag(record_id, false)?;
        return Ok(());
    }
    let token_count = inner.counter.count_text(&section.observations);
    inner.store.update_buffered_reflection(BufferedReflectionUpdate {
        record_id,
        reflection: &section.observations,
        token_count,
        reflected_observation_line_count: reflected_line_count,
    })?;
    Ok(())
}

fn target_from_ratio(threshold: u32, ratio: f32) -> u32 {
    let value = f64::from(threshold) * f64::from(ratio.clamp(0.0, 1.0));
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "product of a u32 and a unit-interval ratio stays within u32"
    )]
    {
        value.round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(text: &str) -> ObservationChunk {
        ObservationChunk {
            id: "c".into(),
            record_id: "r".into(),
            seq: 0,
            cycle_id: "cy".into(),
            observations: text.into(),
            token_count: 1,
            message_tokens: 1,
            message_ids: vec![],
            last_observed_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn buffered_context_separates_active_from_pending() {
        let context = buffered_observer_context("* active", &[chunk("* pending")]);
        assert!(context.starts_with("* active"));
        assert!(context.contains(BUFFERED_SEPARATOR));
        assert!(context.ends_with("* pending"));
    }

    #[test]
    fn buffered_context_without_chunks_is_active_only() {
        let context = buffered_observer_context("* active", &[]);
        assert_eq!(context, "* active");
        assert!(!context.contains(BUFFERED_SEPARATOR));
    }

    #[test]
    fn target_ratio_rounds() {
        assert_eq!(target_from_ratio(400, 0.5), 200);
        assert_eq!(target_from_ratio(401, 0.5), 201);
        assert_eq!(target_from_ratio(400, 1.0), 400);
    }
}
