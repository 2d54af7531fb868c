use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::agent::{AgentCall, AgentCallRequest, AgentUsage};
use crate::error::{InferenceRole, MnemonError, Result};
use crate::events::DebugEvent;
use crate::marker::{
    ActivationMarker, CycleEndMarker, CycleFailedMarker, CycleStartMarker, MarkerPart,
    OperationType, new_cycle_id,
};
use crate::models::MemoryRecord;
use crate::observe::{
    ReflectionAction, merge_buffered_reflection, select_reflection_action,
    validate_reflection_compression,
};
use crate::parse::{MemorySection, parse_memory_section};
use crate::prompt::{ReflectorPromptInput, build_reflector_system_prompt, build_reflector_user_prompt};
use crate::store::MemoryStore;
use crate::stream::StreamWriter;

use super::observer::elapsed_ms;
use super::{AbortSignal, EngineInner};

pub(crate) struct ReflectionCtx<'a> {
    pub scope_key: &'a str,
    pub writer: &'a Arc<dyn StreamWriter>,
    pub abort: &'a AbortSignal,
    pub guidance: Option<&'a str>,
}

impl<S: MemoryStore, A: AgentCall> EngineInner<S, A> {
    fn call_reflector(
        &self,
        abort: &AbortSignal,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<crate::agent::AgentReply> {
        abort.check()?;
        let reply = self.agent.call(&AgentCallRequest {
            role: InferenceRole::Reflector,
            model: self.resolved.reflector_model.model.as_deref(),
            system_prompt,
            user_prompt,
            settings: self.resolved.reflector_model.settings,
            provider_options: self.resolved.reflector_model.provider_options.as_ref(),
        })?;
        abort.check()?;
        Ok(reply)
    }

    /// All-or-nothing activation of a buffered reflection.
    pub(crate) fn activate_buffered_reflection(
        &self,
        record: &MemoryRecord,
        ctx: &ReflectionCtx<'_>,
    ) -> Result<Option<MemoryRecord>> {
        let Some(reflection) = record.buffered_reflection.as_deref() else {
            return Ok(None);
        };
        let reflected_lines = record
            .reflected_observation_line_count
            .map_or(0usize, |v| usize::try_from(v).unwrap_or(usize::MAX));
        let merged =
            merge_buffered_reflection(&record.active_observations, reflected_lines, reflection);
        let token_count = self.counter.count_text(&merged);

        let Some(updated) = self
            .store
            .swap_buffered_reflection_to_active(&record.id, token_count)?
        else {
            return Ok(None);
        };

        let cycle_id = self
            .reflection_buffer_cycles
            .lock()
            .ok()
            .and_then(|mut cycles| cycles.remove(ctx.scope_key))
            .unwrap_or_else(new_cycle_id);
        let marker = MarkerPart::Activation(ActivationMarker {
            cycle_id,
            chunks_activated: 0,
            tokens_activated: record.buffered_reflection_tokens.unwrap_or(0),
            observation_tokens: updated.observation_token_count,
            messages_activated: 0,
            config: self.marker_config(),
            observations: None,
        });
        self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &marker);
        Ok(Some(updated))
    }

    /// Synchronous reflection: compress the whole active observation text
    /// into a new generation, retrying once with an explicit compression
    /// directive when the first pass comes back oversized.
    pub(crate) fn run_sync_reflection(
        &self,
        record: &MemoryRecord,
        ctx: &ReflectionCtx<'_>,
    ) -> Result<Option<MemoryRecord>> {
        if record.active_observations.trim().is_empty() {
            return Ok(None);
        }
        let target_tokens = self.resolved.reflection.observation_tokens;
        self.store.set_reflecting_flag(&record.id, true)?;
        self.store.record_trigger(&record.id, InferenceRole::Reflector)?;

        let started = Instant::now();
        let cycle_id = new_cycle_id();
        self.emit_marker(
            ctx.writer.as_ref(),
            ctx.scope_key,
            &MarkerPart::ObservationStart(self.reflection_start_marker(
                record,
                &cycle_id,
                record.observation_token_count,
            )),
        );

        let outcome = self.reflect_with_retry(record, target_tokens, ctx, &cycle_id, started);
        match outcome {
            Ok((section, tokens, final_cycle_id, usage)) => {
                let updated = self.store.create_reflection_generation(
                    &record.id,
                    &section.observations,
                    tokens,
                    section.current_task.as_deref(),
                    section.suggested_response.as_deref(),
                )?;
                self.emit_marker(
                    ctx.writer.as_ref(),
                    ctx.scope_key,
                    &MarkerPart::ObservationEnd(CycleEndMarker {
                        cycle_id: final_cycle_id,
                        operation_type: OperationType::Reflection,
                        completed_at: Utc::now(),
                        duration_ms: elapsed_ms(started),
                        tokens_observed: record.observation_token_count,
                        observation_tokens: tokens,
                        observations: Some(section.observations),
                        current_task: section.current_task,
                        suggested_response: section.suggested_response,
                    }),
                );
                let _ = usage;
                Ok(Some(updated))
            }
            Err(err) => {
                self.emit_marker(
                    ctx.writer.as_ref(),
                    ctx.scope_key,
                    &MarkerPart::ObservationFailed(CycleFailedMarker {
                        cycle_id,
                        operation_type: OperationType::Reflection,
                        failed_at: Utc::now(),
                        duration_ms: elapsed_ms(started),
                        tokens_attempted: record.observation_token_count,
                        error: err.to_string(),
                    }),
                );
                let _ = self.store.set_reflecting_flag(&record.id, false);
                if err.is_abort() {
                    return Err(err);
                }
                self.events.emit(DebugEvent::BackgroundError {
                    scope_key: ctx.scope_key.to_string(),
                    error: err.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// First pass must land under the target; an oversized result closes
    /// the cycle with a `failed` marker and a fresh cycle retries with a
    /// stronger directive, accepted regardless of size.
    fn reflect_with_retry(
        &self,
        record: &MemoryRecord,
        target_tokens: u32,
        ctx: &ReflectionCtx<'_>,
        first_cycle_id: &str,
        started: Instant,
    ) -> Result<(MemorySection, u32, String, AgentUsage)> {
        let system_prompt = build_reflector_system_prompt();
        let first_prompt = build_reflector_user_prompt(ReflectorPromptInput {
            observations: &record.active_observations,
            guidance: ctx.guidance,
            compression_level: 0,
            target_tokens,
        });
        let first_reply = self.call_reflector(ctx.abort, &system_prompt, &first_prompt)?;
        let mut usage = first_reply.usage;
        let first_section = parse_memory_section(&first_reply.text);
        let first_tokens = self.counter.count_text(&first_section.observations);
        if !first_section.observations.is_empty()
            && validate_reflection_compression(first_tokens, target_tokens)
        {
            return Ok((first_section, first_tokens, first_cycle_id.to_string(), usage));
        }

        self.emit_marker(
            ctx.writer.as_ref(),
            ctx.scope_key,
            &MarkerPart::ObservationFailed(CycleFailedMarker {
                cycle_id: first_cycle_id.to_string(),
                operation_type: OperationType::Reflection,
                failed_at: Utc::now(),
                duration_ms: elapsed_ms(started),
                tokens_attempted: record.observation_token_count,
                error: format!(
                    "reflection produced {first_tokens} tokens against a {target_tokens} token target"
                ),
            }),
        );
        let retry_cycle_id = new_cycle_id();
        self.emit_marker(
            ctx.writer.as_ref(),
            ctx.scope_key,
            &MarkerPart::ObservationStart(self.reflection_start_marker(
                record,
                &retry_cycle_id,
                record.observation_token_count,
            )),
        );

        let retry_prompt = build_reflector_user_prompt(ReflectorPromptInput {
            observations: &record.active_observations,
            guidance: ctx.guidance,
            compression_level: 1,
            target_tokens,
        });
        let retry_reply = self.call_reflector(ctx.abort, &system_prompt, &retry_prompt)?;
        usage = usage.merged(retry_reply.usage);
        let retry_section = parse_memory_section(&retry_reply.text);
        if retry_section.observations.is_empty() {
            return Err(MnemonError::Inference {
                inference_role: InferenceRole::Reflector,
                kind: crate::error::InferenceFailureKind::Schema,
                message: "reflection retry produced no observations".into(),
            });
        }
        let retry_tokens = self.counter.count_text(&retry_section.observations);
        Ok((retry_section, retry_tokens, retry_cycle_id, usage))
    }

    pub(crate) fn reflection_start_marker(
        &self,
        record: &MemoryRecord,
        cycle_id: &str,
        tokens: u32,
    ) -> CycleStartMarker {
        CycleStartMarker {
            cycle_id: cycle_id.to_string(),
            operation_type: OperationType::Reflection,
            started_at: Utc::now(),
            tokens_to_observe: tokens,
            record_id: record.id.clone(),
            thread_id: record.thread_id.clone(),
            thread_ids: record.thread_id.iter().cloned().collect(),
            config: self.marker_config(),
        }
    }
}

/// Post-observation reflection check. With async reflection enabled a
/// buffered result activates first and buffering happens in the background;
/// otherwise the reflector runs synchronously once the observation span
/// exceeds its threshold.
pub(crate) fn maybe_reflect<S: MemoryStore + 'static, A: AgentCall + 'static>(
    inner: &Arc<EngineInner<S, A>>,
    record: &MemoryRecord,
    ctx: &ReflectionCtx<'_>,
) -> Result<Option<MemoryRecord>> {
    let action = select_reflection_action(
        record,
        inner.resolved.reflection.observation_tokens,
        inner.resolved.reflection.async_activation,
    );
    match action {
        ReflectionAction::None => Ok(None),
        ReflectionAction::Buffer => {
            super::buffer::spawn_reflection_buffering(inner, record, ctx.scope_key);
            Ok(None)
        }
        ReflectionAction::Reflect => {
            if record.has_buffered_reflection() {
                return inner.activate_buffered_reflection(record, ctx);
            }
            inner.run_sync_reflection(record, ctx)
        }
    }
}
