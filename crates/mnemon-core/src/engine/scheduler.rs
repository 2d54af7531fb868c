use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::agent::AgentCall;
use crate::error::{MnemonError, Result};
use crate::marker::{MarkerPart, ProgressMarker, find_last_completed_observation_boundary};
use crate::models::{MemoryRecord, MemoryScope, Message};
use crate::observe::{
    ObserverDecision, build_other_conversation_blocks, decide_observer_action,
    filter_unobserved_messages, partition_covered_parts, should_skip_continuation_hints,
};
use crate::store::MemoryStore;
use crate::stream::{NullStreamWriter, StreamWriter};

use super::buffer::spawn_observation_buffering;
use super::inject::{
    build_continuation_reminder, build_observation_system_message, is_injected_message,
};
use super::observer::SyncObservationCtx;
use super::reflector::{ReflectionCtx, maybe_reflect};
use super::{AbortSignal, EngineInner, MemoryEngine, TurnState};

/// Per-line budget when rendering cross-thread context.
const OTHER_CONVERSATION_MAX_PART_CHARS: usize = 1_200;

/// One scheduler step of the agent turn.
pub struct InputStepArgs {
    pub thread_id: String,
    pub resource_id: Option<String>,
    pub step_number: u32,
    /// The outgoing context list as the agent framework currently holds it.
    pub messages: Vec<Message>,
    /// Input messages this step introduced.
    pub step_input: Vec<Message>,
    /// Response messages produced so far this turn.
    pub step_response: Vec<Message>,
    pub writer: Arc<dyn StreamWriter>,
    pub abort: AbortSignal,
}

/// Final persistence for a finished turn.
pub struct OutputResultArgs {
    pub thread_id: String,
    pub resource_id: Option<String>,
    pub input: Vec<Message>,
    pub response: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ProcessedStep {
    /// Rewritten outgoing list: observation system message prepended,
    /// observed parts filtered out.
    pub messages: Vec<Message>,
}

struct StepEvaluation {
    decision: ObserverDecision,
    total_pending_tokens: u32,
    unobserved_ids: Vec<String>,
}

impl<S: MemoryStore, A: AgentCall> EngineInner<S, A> {
    fn evaluate_step(
        &self,
        record: &MemoryRecord,
        messages: &[Message],
        turn: &TurnState,
        other_thread_tokens: u32,
    ) -> StepEvaluation {
        let observed: HashSet<String> = record.observed_message_ids.iter().cloned().collect();
        let unobserved = filter_unobserved_messages(messages, &observed, record.last_observed_at);
        let unobserved: Vec<Message> = unobserved
            .into_iter()
            .filter(|m| !is_injected_message(m))
            .collect();
        // Messages already persisted are carried by the record's pending
        // tally; only the unsaved tail counts as session tokens.
        let current_session_tokens = unobserved
            .iter()
            .filter(|m| !turn.saved_ids.contains(&m.id))
            .fold(0u32, |sum, m| sum.saturating_add(self.counter.count_message(m)));
        let total_pending_tokens = record
            .pending_message_tokens
            .saturating_add(current_session_tokens)
            .saturating_add(other_thread_tokens);
        let decision = decide_observer_action(record, total_pending_tokens, &self.resolved.observation);
        StepEvaluation {
            decision,
            total_pending_tokens,
            unobserved_ids: unobserved.into_iter().map(|m| m.id).collect(),
        }
    }

    /// Persists step messages with the sealed-id rewrite, growing the
    /// record's pending tally for anything newly saved and unobserved.
    fn persist_step_messages(
        &self,
        step_messages: &[Message],
        list: &mut Vec<Message>,
        record: &mut MemoryRecord,
        turn: &mut TurnState,
    ) -> Result<()> {
        let observed: HashSet<&str> = record
            .observed_message_ids
            .iter()
            .map(String::as_str)
            .collect();
        let mut to_save = Vec::<(String, Message)>::new();
        for message in step_messages {
            if is_injected_message(message) || turn.saved_ids.contains(&message.id) {
                continue;
            }
            let mut row = message.clone();
            if turn.sealed_ids.contains(&row.id) {
                // Never overwrite a sealed historical row.
                row.id = Uuid::new_v4().to_string();
            }
            to_save.push((message.id.clone(), row));
        }
        if to_save.is_empty() {
            return Ok(());
        }

        let rows: Vec<Message> = to_save.iter().map(|(_, row)| row.clone()).collect();
        self.store.save_messages(&rows)?;

        let mut pending = record.pending_message_tokens;
        for (original_id, row) in &to_save {
            if find_last_completed_observation_boundary(row).is_some() {
                turn.sealed_ids.insert(row.id.clone());
            }
            turn.saved_ids.insert(row.id.clone());
            if !observed.contains(row.id.as_str()) {
                pending = pending.saturating_add(self.counter.count_message(row));
            }
            // Re-add under the persisted id so the next step sees it.
            if let Some(existing) = list.iter_mut().find(|m| &m.id == original_id) {
                *existing = row.clone();
            } else {
                list.push(row.clone());
            }
        }
        if pending != record.pending_message_tokens {
            self.store.update_pending_tokens(&record.id, pending)?;
            record.pending_message_tokens = pending;
        }
        Ok(())
    }

    fn progress_marker(
        &self,
        record: &MemoryRecord,
        evaluation: &StepEvaluation,
        buffered: &[crate::models::ObservationChunk],
        step_number: u32,
    ) -> ProgressMarker {
        let threshold = evaluation.decision.threshold.max(1);
        let reflection_threshold = self.resolved.reflection.observation_tokens.max(1);
        ProgressMarker {
            pending_tokens: evaluation.total_pending_tokens,
            message_tokens: evaluation.decision.threshold,
            message_tokens_percent: percent(evaluation.total_pending_tokens, threshold),
            observation_tokens: record.observation_token_count,
            observation_tokens_threshold: self.resolved.reflection.observation_tokens,
            observation_tokens_percent: percent(record.observation_token_count, reflection_threshold),
            will_observe: evaluation.decision.threshold_reached,
            buffered_chunks_count: u32::try_from(buffered.len()).unwrap_or(u32::MAX),
            buffered_message_tokens: buffered
                .iter()
                .fold(0u32, |sum, c| sum.saturating_add(c.message_tokens)),
            buffered_observation_tokens: buffered
                .iter()
                .fold(0u32, |sum, c| sum.saturating_add(c.token_count)),
            has_buffered_chunks: !buffered.is_empty(),
            step_number,
        }
    }
}

fn percent(value: u32, denominator: u32) -> f32 {
    if denominator == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss, reason = "display-only percentage")]
    {
        (value as f64 / f64::from(denominator) * 100.0) as f32
    }
}

impl<S: MemoryStore + 'static, A: AgentCall + 'static> MemoryEngine<S, A> {
    /// Per-step entry point: decides observe / buffer / activate / reflect,
    /// injects the observation system message, and rewrites the outgoing
    /// message list.
    #[allow(clippy::too_many_lines, reason = "the step protocol is one ordered sequence")]
    pub fn process_input_step(
        &self,
        args: InputStepArgs,
        turn: &mut TurnState,
    ) -> Result<ProcessedStep> {
        let inner = &self.inner;
        let InputStepArgs {
            thread_id,
            resource_id,
            step_number,
            messages,
            step_input,
            step_response,
            writer,
            abort,
        } = args;
        let resource_id = resource_id.as_deref();
        let scope_key = inner.scope_key(&thread_id, resource_id)?;
        let mut record = inner.load_record(&thread_id, resource_id)?;

        let mut list: Vec<Message> =
            messages.into_iter().filter(|m| !is_injected_message(m)).collect();
        for message in step_input.iter().chain(step_response.iter()) {
            if !list.iter().any(|m| m.id == message.id) {
                list.push(message.clone());
            }
        }

        // Bootstrap: pull unobserved history into the working list. Other
        // threads' context is refreshed every step, so resource scope loads
        // only the current thread here.
        if step_number == 0 {
            for message in inner.store.list_thread_messages(&thread_id, None)? {
                turn.saved_ids.insert(message.id.clone());
                if find_last_completed_observation_boundary(&message).is_some() {
                    turn.sealed_ids.insert(message.id.clone());
                }
                if !list.iter().any(|m| m.id == message.id) {
                    list.push(message);
                }
            }
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        }

        // Cross-thread context, refreshed every step in resource scope.
        let mut other_thread_messages = Vec::<Message>::new();
        if inner.resolved.scope == MemoryScope::Resource
            && let Some(resource_id) = resource_id
        {
            let observed: HashSet<String> =
                record.observed_message_ids.iter().cloned().collect();
            for thread in inner.store.list_threads_by_resource(resource_id)? {
                if thread.id == thread_id {
                    continue;
                }
                for message in inner
                    .store
                    .list_thread_messages(&thread.id, thread.memory.last_observed_at)?
                {
                    if !observed.contains(&message.id) {
                        other_thread_messages.push(message);
                    }
                }
            }
        }
        let other_context = build_other_conversation_blocks(
            &other_thread_messages,
            &thread_id,
            inner.resolved.obscure_thread_ids,
            OTHER_CONVERSATION_MAX_PART_CHARS,
        );
        let other_thread_tokens = inner.counter.count_messages(&other_thread_messages);

        // Step-0 activation of buffered observation chunks.
        if step_number == 0 && inner.resolved.observation.async_enabled() {
            let chunks = inner.store.list_buffered_chunks(&record.id)?;
            if !chunks.is_empty()
                && let Some(swap) = inner.activate_buffered_observations(
                    &scope_key,
                    &record.id,
                    writer.as_ref(),
                )?
            {
                let activated: HashSet<String> =
                    swap.activated_message_ids.iter().cloned().collect();
                list.retain(|m| !activated.contains(&m.id));
                record = swap.record;
                let reflection_ctx = ReflectionCtx {
                    scope_key: &scope_key,
                    writer: &writer,
                    abort: &abort,
                    guidance: None,
                };
                if let Some(updated) = maybe_reflect(inner, &record, &reflection_ctx)? {
                    record = updated;
                }
            }
        }

        // Threshold evaluation and the per-step progress marker.
        let mut evaluation = inner.evaluate_step(&record, &list, turn, other_thread_tokens);
        let buffered = if inner.resolved.observation.async_enabled() {
            inner.store.list_buffered_chunks(&record.id)?
        } else {
            Vec::new()
        };
        inner.emit_marker(
            writer.as_ref(),
            &scope_key,
            &MarkerPart::Progress(inner.progress_marker(&record, &evaluation, &buffered, step_number)),
        );

        // Below threshold: persist what this step produced (so a crash
        // mid-turn loses at most one step, and buffering runs can read it),
        // then keep the background pipeline warm. Saving moves tokens from
        // the session tally into the record's pending tally; the total is
        // unchanged.
        if !evaluation.decision.threshold_reached {
            let step_messages: Vec<Message> = step_input
                .iter()
                .chain(step_response.iter())
                .cloned()
                .collect();
            inner.persist_step_messages(&step_messages, &mut list, &mut record, turn)?;
            if evaluation.decision.interval_triggered {
                spawn_observation_buffering(
                    inner,
                    &scope_key,
                    &record,
                    &thread_id,
                    evaluation.total_pending_tokens,
                    &writer,
                );
            }
        }

        // Threshold branch; never on the first step of the turn.
        if evaluation.decision.threshold_reached && step_number > 0 {
            let lock = inner.scope_lock(&scope_key)?;
            let _guard = lock
                .lock()
                .map_err(|_| MnemonError::lock_poisoned("scope"))?;

            // Another step may have observed while we waited on the lock.
            if let Some(fresh) = inner.store.get_record(&scope_key)? {
                record = fresh;
            }
            evaluation = inner.evaluate_step(&record, &list, turn, other_thread_tokens);
            if evaluation.decision.threshold_reached {
                let mut handled = false;
                if inner.resolved.observation.async_enabled() {
                    if let Some(swap) = inner.activate_buffered_observations(
                        &scope_key,
                        &record.id,
                        writer.as_ref(),
                    )? {
                        let activated: HashSet<String> =
                            swap.activated_message_ids.iter().cloned().collect();
                        list.retain(|m| !activated.contains(&m.id));
                        record = swap.record;
                        let reflection_ctx = ReflectionCtx {
                            scope_key: &scope_key,
                            writer: &writer,
                            abort: &abort,
                            guidance: None,
                        };
                        if let Some(updated) = maybe_reflect(inner, &record, &reflection_ctx)? {
                            record = updated;
                        }
                        handled = true;
                    } else if !evaluation.decision.block_after_exceeded {
                        // Async path without committed chunks: buffering will
                        // catch up unless the hard ceiling forces sync work.
                        spawn_observation_buffering(
                            inner,
                            &scope_key,
                            &record,
                            &thread_id,
                            evaluation.total_pending_tokens,
                            &writer,
                        );
                        handled = true;
                    }
                }
                if !handled {
                    let ctx = SyncObservationCtx {
                        scope_key: &scope_key,
                        thread_id: &thread_id,
                        resource_id,
                        writer: &writer,
                        abort: &abort,
                        skip_continuation_hints: should_skip_continuation_hints(
                            evaluation.decision,
                        ),
                        threshold: evaluation.decision.threshold,
                    };
                    let observed_record = match inner.resolved.scope {
                        MemoryScope::Thread => inner.run_single_thread_observation(
                            &record,
                            &mut list,
                            &evaluation.unobserved_ids,
                            other_context.as_deref(),
                            &ctx,
                            turn,
                        )?,
                        MemoryScope::Resource => {
                            let unsaved: Vec<Message> = list
                                .iter()
                                .filter(|m| {
                                    !turn.saved_ids.contains(&m.id) && !is_injected_message(m)
                                })
                                .cloned()
                                .collect();
                            inner.run_resource_observation(&record, &mut list, &unsaved, &ctx, turn)?
                        }
                    };
                    if let Some(updated) = observed_record {
                        record = updated;
                        let observed: HashSet<String> =
                            record.observed_message_ids.iter().cloned().collect();
                        list.retain(|m| !observed.contains(&m.id));
                        let reflection_ctx = ReflectionCtx {
                            scope_key: &scope_key,
                            writer: &writer,
                            abort: &abort,
                            guidance: None,
                        };
                        if let Some(updated) = maybe_reflect(inner, &record, &reflection_ctx)? {
                            record = updated;
                        }
                    }
                }
            }
        }

        // Inject the observation system message and continuation reminder.
        list.retain(|m| !is_injected_message(m));
        if !record.active_observations.trim().is_empty() {
            let system = build_observation_system_message(
                &record,
                other_context.as_deref(),
                &thread_id,
                Utc::now(),
            );
            list.insert(0, system);
            list.insert(1, build_continuation_reminder(&thread_id));
        }

        // Step-0 cleanup: drop anything a completed observation already
        // covers.
        if step_number == 0 {
            let (injected, rest): (Vec<Message>, Vec<Message>) =
                list.into_iter().partition(is_injected_message);
            let observed: HashSet<String> =
                record.observed_message_ids.iter().cloned().collect();
            let has_prior_activation = !observed.is_empty();
            let (kept, _removed) = partition_covered_parts(
                rest,
                &observed,
                record.last_observed_at,
                has_prior_activation,
            );
            let mut rebuilt = injected;
            rebuilt.extend(kept);
            list = rebuilt;
        }

        Ok(ProcessedStep { messages: list })
    }

    /// Final save of any turn messages the per-step saves did not cover,
    /// using the same sealed-id rewrite.
    pub fn process_output_result(
        &self,
        args: OutputResultArgs,
        turn: &mut TurnState,
    ) -> Result<()> {
        let inner = &self.inner;
        let resource_id = args.resource_id.as_deref();
        let mut record = inner.load_record(&args.thread_id, resource_id)?;
        let mut step_messages: Vec<Message> = Vec::new();
        for message in args.input.iter().chain(args.response.iter()) {
            if is_injected_message(message) {
                continue;
            }
            if turn.saved_ids.contains(&message.id) {
                // Already persisted this turn; streaming may have grown the
                // tail past a sealed boundary, which must land in a new row.
                if let Some(tail) = split_after_seal(message) {
                    step_messages.push(tail);
                }
                continue;
            }
            step_messages.push(message.clone());
        }
        let mut scratch_list = Vec::new();
        inner.persist_step_messages(&step_messages, &mut scratch_list, &mut record, turn)?;
        Ok(())
    }

    /// Forces a synchronous observation over everything unobserved, outside
    /// the normal threshold schedule.
    pub fn observe(&self, thread_id: &str, resource_id: Option<&str>) -> Result<Option<MemoryRecord>> {
        let inner = &self.inner;
        let scope_key = inner.scope_key(thread_id, resource_id)?;
        let record = inner.load_record(thread_id, resource_id)?;
        let lock = inner.scope_lock(&scope_key)?;
        let _guard = lock
            .lock()
            .map_err(|_| MnemonError::lock_poisoned("scope"))?;

        let observed: HashSet<String> = record.observed_message_ids.iter().cloned().collect();
        let mut list =
            filter_unobserved_messages(&inner.store.list_thread_messages(thread_id, None)?, &observed, record.last_observed_at);
        if list.is_empty() && inner.resolved.scope == MemoryScope::Thread {
            return Ok(None);
        }
        let batch_ids: Vec<String> = list.iter().map(|m| m.id.clone()).collect();
        let writer: Arc<dyn StreamWriter> = Arc::new(NullStreamWriter);
        let abort = AbortSignal::new();
        let ctx = SyncObservationCtx {
            scope_key: &scope_key,
            thread_id,
            resource_id,
            writer: &writer,
            abort: &abort,
            skip_continuation_hints: false,
            threshold: inner
                .resolved
                .observation
                .effective_threshold(record.observation_token_count),
        };
        let mut turn = TurnState::new();
        match inner.resolved.scope {
            MemoryScope::Thread => inner.run_single_thread_observation(
                &record,
                &mut list,
                &batch_ids,
                None,
                &ctx,
                &mut turn,
            ),
            MemoryScope::Resource => {
                inner.run_resource_observation(&record, &mut list, &[], &ctx, &mut turn)
            }
        }
    }

    /// Forces a reflection pass, optionally steered by human guidance.
    pub fn reflect(
        &self,
        thread_id: &str,
        resource_id: Option<&str>,
        guidance: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let inner = &self.inner;
        let scope_key = inner.scope_key(thread_id, resource_id)?;
        let record = inner.load_record(thread_id, resource_id)?;
        if record.is_reflecting {
            return Ok(None);
        }
        let lock = inner.scope_lock(&scope_key)?;
        let _guard = lock
            .lock()
            .map_err(|_| MnemonError::lock_poisoned("scope"))?;
        let writer: Arc<dyn StreamWriter> = Arc::new(NullStreamWriter);
        let abort = AbortSignal::new();
        let ctx = ReflectionCtx {
            scope_key: &scope_key,
            writer: &writer,
            abort: &abort,
            guidance,
        };
        if record.has_buffered_reflection() {
            return inner.activate_buffered_reflection(&record, &ctx);
        }
        inner.run_sync_reflection(&record, &ctx)
    }
}

/// Streaming content appended after a sealed tail becomes a new message
/// with a fresh id; the sealed row is never touched again.
fn split_after_seal(message: &Message) -> Option<Message> {
    let last_sealed = message
        .parts
        .iter()
        .rposition(crate::models::MessagePart::is_sealed)?;
    if last_sealed + 1 >= message.parts.len() {
        return None;
    }
    let mut tail = message.clone();
    tail.id = Uuid::new_v4().to_string();
    tail.parts = message.parts[last_sealed + 1..].to_vec();
    Some(tail)
}
