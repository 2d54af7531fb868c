use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::agent::{AgentCall, AgentCallRequest, AgentUsage};
use crate::error::{InferenceRole, MnemonError, Result};
use crate::events::DebugEvent;
use crate::marker::{
    CycleEndMarker, CycleFailedMarker, CycleStartMarker, MarkerConfig, MarkerPart, OperationType,
    append_observation_end, new_cycle_id,
};
use crate::models::{MemoryRecord, MemoryScope, Message, MessagePart, ThreadMemoryMetadata};
use crate::observe::{ScoredMessage, greedy_threshold_batch, merge_observation_texts};
use crate::parse::{
    MemorySection, ThreadSection, parse_memory_section, parse_multi_thread_output,
    strip_thread_tags, wrap_thread_sections,
};
use crate::prompt::{
    ObserverPromptInput, ThreadMessages, build_multi_thread_observer_system_prompt,
    build_multi_thread_observer_user_prompt, build_observer_system_prompt,
    build_observer_user_prompt, format_messages_for_prompt,
};
use crate::store::{ActiveObservationsUpdate, MemoryStore};
use crate::stream::StreamWriter;
use crate::token::approximate_text_tokens;

use super::{AbortSignal, EngineInner, TurnState};

const MAX_BATCH_PARALLELISM: usize = 4;

pub(crate) struct SyncObservationCtx<'a> {
    pub scope_key: &'a str,
    pub thread_id: &'a str,
    pub resource_id: Option<&'a str>,
    pub writer: &'a Arc<dyn StreamWriter>,
    pub abort: &'a AbortSignal,
    pub skip_continuation_hints: bool,
    pub threshold: u32,
}

impl<S: MemoryStore, A: AgentCall> EngineInner<S, A> {
    pub(crate) fn marker_config(&self) -> MarkerConfig {
        MarkerConfig {
            message_tokens: self.resolved.observation.message_tokens_base,
            observation_tokens: self.resolved.reflection.observation_tokens,
            scope: self.resolved.scope,
        }
    }

    pub(crate) fn call_observer(
        &self,
        abort: &AbortSignal,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<crate::agent::AgentReply> {
        abort.check()?;
        let reply = self.agent.call(&AgentCallRequest {
            role: InferenceRole::Observer,
            model: self.resolved.observer_model.model.as_deref(),
            system_prompt,
            user_prompt,
            settings: self.resolved.observer_model.settings,
            provider_options: self.resolved.observer_model.provider_options.as_ref(),
        })?;
        abort.check()?;
        Ok(reply)
    }

    fn start_marker(
        &self,
        cycle_id: &str,
        record: &MemoryRecord,
        tokens_to_observe: u32,
        thread_id: &str,
        thread_ids: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> CycleStartMarker {
        CycleStartMarker {
            cycle_id: cycle_id.to_string(),
            operation_type: OperationType::Observation,
            started_at,
            tokens_to_observe,
            record_id: record.id.clone(),
            thread_id: Some(thread_id.to_string()),
            thread_ids,
            config: self.marker_config(),
        }
    }

    fn observation_failed_marker(
        &self,
        cycle_id: &str,
        started: Instant,
        tokens_attempted: u32,
        error: &MnemonError,
    ) -> MarkerPart {
        MarkerPart::ObservationFailed(CycleFailedMarker {
            cycle_id: cycle_id.to_string(),
            operation_type: OperationType::Observation,
            failed_at: Utc::now(),
            duration_ms: elapsed_ms(started),
            tokens_attempted,
            error: error.to_string(),
        })
    }

    /// Synchronous single-thread observation. Returns the refreshed record
    /// on success, `None` when the pass was skipped or its error was
    /// swallowed.
    #[allow(clippy::too_many_lines, reason = "one linear protocol, kept in order")]
    pub(crate) fn run_single_thread_observation(
        &self,
        record: &MemoryRecord,
        messages: &mut [Message],
        batch_ids: &[String],
        other_context: Option<&str>,
        ctx: &SyncObservationCtx<'_>,
        turn: &mut TurnState,
    ) -> Result<Option<MemoryRecord>> {
        let batch: Vec<Message> = messages
            .iter()
            .filter(|m| batch_ids.contains(&m.id))
            .cloned()
            .collect();
        if batch.is_empty() {
            return Ok(None);
        }
        let tokens_to_observe = self.counter.count_messages(&batch);
        let started = Instant::now();
        let started_at = Utc::now();
        let cycle_id = new_cycle_id();

        let start = MarkerPart::ObservationStart(self.start_marker(
            &cycle_id,
            record,
            tokens_to_observe,
            ctx.thread_id,
            vec![ctx.thread_id.to_string()],
            started_at,
        ));
        let host_id = batch.last().map(|m| m.id.clone());
        if let Some(host) = messages.iter_mut().rev().find(|m| Some(&m.id) == host_id.as_ref()) {
            host.parts.push(MessagePart::marker(start.clone()));
        }
        self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &start);

        // Another instance may have advanced the cursor since we loaded the
        // record; observing the same span twice would violate the
        // no-double-observation contract.
        let fresh = self.store.get_record(ctx.scope_key)?;
        if let Some(fresh) = &fresh
            && fresh.last_observed_at > record.last_observed_at
        {
            let failed = self.observation_failed_marker(
                &cycle_id,
                started,
                tokens_to_observe,
                &MnemonError::Conflict("observation superseded by another instance".into()),
            );
            self.push_marker_to_host(messages, host_id.as_deref(), &failed);
            self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &failed);
            return Ok(None);
        }
        let record = fresh.unwrap_or_else(|| record.clone());

        self.store.set_observing_flag(&record.id, true)?;
        self.store.record_trigger(&record.id, InferenceRole::Observer)?;

        let outcome = self.observe_batch_single(&record, &batch, other_context, ctx);
        match outcome {
            Ok(section) => {
                let updated = self.persist_single_thread_outcome(
                    &record,
                    &batch,
                    section,
                    ctx,
                    messages,
                    host_id.as_deref(),
                    &cycle_id,
                    started,
                    turn,
                )?;
                Ok(Some(updated))
            }
            Err(err) => {
                let failed =
                    self.observation_failed_marker(&cycle_id, started, tokens_to_observe, &err);
                self.push_marker_to_host(messages, host_id.as_deref(), &failed);
                self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &failed);
                let _ = self.store.set_observing_flag(&record.id, false);
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

    fn observe_batch_single(
        &self,
        record: &MemoryRecord,
        batch: &[Message],
        other_context: Option<&str>,
        ctx: &SyncObservationCtx<'_>,
    ) -> Result<(MemorySection, AgentUsage)> {
        let message_history = format_messages_for_prompt(batch);
        let system_prompt = build_observer_system_prompt();
        let user_prompt = build_observer_user_prompt(ObserverPromptInput {
            existing_observations: Some(&record.active_observations),
            message_history: &message_history,
            other_conversation_context: other_context,
            skip_continuation_hints: ctx.skip_continuation_hints,
        });
        let reply = self.call_observer(ctx.abort, &system_prompt, &user_prompt)?;
        let mut section = parse_memory_section(&reply.text);
        // Defense in depth: no thread attribution leaks into thread scope.
        section.observations = strip_thread_tags(&section.observations);
        Ok((section, reply.usage))
    }

    #[allow(clippy::too_many_arguments, reason = "persistence needs the whole step context")]
    fn persist_single_thread_outcome(
        &self,
        record: &MemoryRecord,
        batch: &[Message],
        (section, usage): (MemorySection, AgentUsage),
        ctx: &SyncObservationCtx<'_>,
        messages: &mut [Message],
        host_id: Option<&str>,
        cycle_id: &str,
        started: Instant,
        turn: &mut TurnState,
    ) -> Result<MemoryRecord> {
        let new_text = if self.resolved.scope == MemoryScope::Resource {
            wrap_thread_sections(&[ThreadSection {
                thread_id: ctx.thread_id.to_string(),
                observations: section.observations.clone(),
                current_task: None,
                suggested_response: None,
            }])
        } else {
            section.observations.clone()
        };
        let merged = merge_observation_texts(&record.active_observations, &new_text);
        let token_count = self.counter.count_text(&merged);
        let last_observed_at = batch
            .iter()
            .map(|m| m.created_at)
            .max()
            .unwrap_or_else(Utc::now);
        let mut observed_ids = record.observed_message_ids.clone();
        for message in batch {
            if !observed_ids.contains(&message.id) {
                observed_ids.push(message.id.clone());
            }
        }

        self.store.update_active_observations(ActiveObservationsUpdate {
            record_id: &record.id,
            observations: &merged,
            token_count,
            pending_message_tokens: 0,
            last_observed_at,
            observed_message_ids: &observed_ids,
            current_task: section.current_task.as_deref(),
            suggested_response: section.suggested_response.as_deref(),
        })?;
        self.store.update_thread_memory(
            ctx.thread_id,
            &ThreadMemoryMetadata {
                last_observed_at: Some(last_observed_at),
                current_task: section.current_task.clone(),
                suggested_response: section.suggested_response.clone(),
            },
        )?;

        let end = CycleEndMarker {
            cycle_id: cycle_id.to_string(),
            operation_type: OperationType::Observation,
            completed_at: Utc::now(),
            duration_ms: elapsed_ms(started),
            tokens_observed: self.counter.count_messages(batch),
            observation_tokens: token_count,
            observations: Some(section.observations),
            current_task: section.current_task,
            suggested_response: section.suggested_response,
        };
        if let Some(host) = host_id.and_then(|id| messages.iter_mut().find(|m| m.id == id)) {
            append_observation_end(host, end.clone());
            self.store.save_messages(std::slice::from_ref(host))?;
            turn.sealed_ids.insert(host.id.clone());
            turn.saved_ids.insert(host.id.clone());
        }
        self.emit_marker(
            ctx.writer.as_ref(),
            ctx.scope_key,
            &MarkerPart::ObservationEnd(end),
        );
        self.store.set_observing_flag(&record.id, false)?;

        let _ = usage;
        self.store.get_record(ctx.scope_key)?.ok_or_else(|| {
            MnemonError::Internal(format!("record vanished for scope {}", ctx.scope_key))
        })
    }

    fn push_marker_to_host(
        &self,
        messages: &mut [Message],
        host_id: Option<&str>,
        marker: &MarkerPart,
    ) {
        if let Some(host) = host_id.and_then(|id| messages.iter_mut().find(|m| m.id == id)) {
            host.parts.push(MessagePart::marker(marker.clone()));
        }
    }

    /// Resource-scoped synchronous observation: one multi-thread Observer
    /// pass over the unobserved tails of every thread in the resource.
    #[allow(clippy::too_many_lines, reason = "one linear protocol, kept in order")]
    pub(crate) fn run_resource_observation(
        &self,
        record: &MemoryRecord,
        messages: &mut [Message],
        current_thread_unsaved: &[Message],
        ctx: &SyncObservationCtx<'_>,
        turn: &mut TurnState,
    ) -> Result<Option<MemoryRecord>> {
        let Some(resource_id) = ctx.resource_id else {
            return Ok(None);
        };
        let observed: HashSet<String> = record.observed_message_ids.iter().cloned().collect();

        // Per-thread cursors are authoritative in resource scope.
        let mut candidates = Vec::<Message>::new();
        let mut cursors = BTreeMap::<String, Option<DateTime<Utc>>>::new();
        for thread in self.store.list_threads_by_resource(resource_id)? {
            let cursor = thread.memory.last_observed_at;
            cursors.insert(thread.id.clone(), cursor);
            for message in self.store.list_thread_messages(&thread.id, cursor)? {
                if !observed.contains(&message.id) {
                    candidates.push(message);
                }
            }
        }
        for message in current_thread_unsaved {
            if !observed.contains(&message.id) && !candidates.iter().any(|m| m.id == message.id) {
                candidates.push(message.clone());
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let scored: Vec<ScoredMessage> = candidates
            .into_iter()
            .map(|message| ScoredMessage {
                tokens: self.counter.count_message(&message),
                message,
            })
            .collect();
        let batch = greedy_threshold_batch(scored, ctx.threshold);
        if batch.is_empty() {
            return Ok(None);
        }
        let tokens_to_observe = batch.iter().fold(0u32, |sum, s| sum.saturating_add(s.tokens));

        // Oldest-first thread order for stable merges.
        let mut thread_order = Vec::<String>::new();
        let mut by_thread = BTreeMap::<String, Vec<&Message>>::new();
        for scored in &batch {
            let thread_id = scored.message.thread_id.clone();
            if !thread_order.contains(&thread_id) {
                thread_order.push(thread_id.clone());
            }
            by_thread.entry(thread_id).or_default().push(&scored.message);
        }
        let thread_messages: Vec<ThreadMessages> = thread_order
            .iter()
            .filter_map(|thread_id| {
                let group = by_thread.get(thread_id)?;
                let history =
                    format_messages_for_prompt(&group.iter().map(|m| (*m).clone()).collect::<Vec<_>>());
                if history.is_empty() {
                    return None;
                }
                Some(ThreadMessages {
                    thread_id: thread_id.clone(),
                    message_history: history,
                })
            })
            .collect();
        if thread_messages.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let started_at = Utc::now();
        let cycle_id = new_cycle_id();
        let start = MarkerPart::ObservationStart(self.start_marker(
            &cycle_id,
            record,
            tokens_to_observe,
            ctx.thread_id,
            thread_order.clone(),
            started_at,
        ));
        let host_id = batch
            .iter()
            .filter(|s| s.message.thread_id == ctx.thread_id)
            .next_back()
            .map(|s| s.message.id.clone());
        self.push_marker_to_host(messages, host_id.as_deref(), &start);
        self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &start);

        self.store.set_observing_flag(&record.id, true)?;
        self.store.record_trigger(&record.id, InferenceRole::Observer)?;

        let batches = chunk_thread_batches(
            &thread_messages,
            self.resolved.observation.max_tokens_per_batch,
        );
        let outcome = self.run_thread_batches(record, batches, ctx);
        let sections = match outcome {
            Ok(sections) => sections,
            Err(err) => {
                let failed =
                    self.observation_failed_marker(&cycle_id, started, tokens_to_observe, &err);
                self.push_marker_to_host(messages, host_id.as_deref(), &failed);
                self.emit_marker(ctx.writer.as_ref(), ctx.scope_key, &failed);
                let _ = self.store.set_observing_flag(&record.id, false);
                if err.is_abort() {
                    return Err(err);
                }
                self.events.emit(DebugEvent::BackgroundError {
                    scope_key: ctx.scope_key.to_string(),
                    error: err.to_string(),
                });
                return Ok(None);
            }
        };

        // Merge in chosen thread order; threads the Observer skipped still
        // advance their cursor.
        let mut merged = record.active_observations.clone();
        let mut primary_task = None;
        let mut primary_suggested = None;
        for thread_id in &thread_order {
            let section = sections.iter().rev().find(|s| &s.thread_id == thread_id);
            if let Some(section) = section {
                if !section.observations.trim().is_empty() {
                    let wrapped = wrap_thread_sections(std::slice::from_ref(section));
                    merged = merge_observation_texts(&merged, &wrapped);
                }
                if thread_id == ctx.thread_id {
                    primary_task = section.current_task.clone();
                    primary_suggested = section.suggested_response.clone();
                }
            }
            let thread_cursor = by_thread
                .get(thread_id)
                .and_then(|group| group.iter().map(|m| m.created_at).max());
            if let Some(cursor) = thread_cursor {
                self.store.update_thread_memory(
                    thread_id,
                    &ThreadMemoryMetadata {
                        last_observed_at: Some(cursor.max(cursors.get(thread_id).copied().flatten().unwrap_or(cursor))),
                        current_task: section.and_then(|s| s.current_task.clone()),
                        suggested_response: section.and_then(|s| s.suggested_response.clone()),
                    },
                )?;
            }
        }

        let token_count = self.counter.count_text(&merged);
        let last_observed_at = batch
            .iter()
            .map(|s| s.message.created_at)
            .max()
            .unwrap_or_else(Utc::now);
        let mut observed_ids = record.observed_message_ids.clone();
        for scored in &batch {
            if !observed_ids.contains(&scored.message.id) {
                observed_ids.push(scored.message.id.clone());
            }
        }
        self.store.update_active_observations(ActiveObservationsUpdate {
            record_id: &record.id,
            observations: &merged,
            token_count,
            pending_message_tokens: 0,
            last_observed_at,
            observed_message_ids: &observed_ids,
            current_task: primary_task.as_deref(),
            suggested_response: primary_suggested.as_deref(),
        })?;

        let end = CycleEndMarker {
            cycle_id,
            operation_type: OperationType::Observation,
            completed_at: Utc::now(),
            duration_ms: elapsed_ms(started),
            tokens_observed: tokens_to_observe,
            observation_tokens: token_count,
            observations: None,
            current_task: primary_task,
            suggested_response: primary_suggested,
        };
        if let Some(host) = host_id
            .as_deref()
            .and_then(|id| messages.iter_mut().find(|m| m.id == id))
        {
            append_observation_end(host, end.clone());
            self.store.save_messages(std::slice::from_ref(host))?;
            turn.sealed_ids.insert(host.id.clone());
            turn.saved_ids.insert(host.id.clone());
        }
        self.emit_marker(
            ctx.writer.as_ref(),
            ctx.scope_key,
            &MarkerPart::ObservationEnd(end),
        );
        self.store.set_observing_flag(&record.id, false)?;

        self.store
            .get_record(ctx.scope_key)?
            .map(Some)
            .ok_or_else(|| {
                MnemonError::Internal(format!("record vanished for scope {}", ctx.scope_key))
            })
    }

    /// Issues the per-batch multi-thread prompts, in parallel when more than
    /// one batch was formed.
    fn run_thread_batches(
        &self,
        record: &MemoryRecord,
        batches: Vec<Vec<ThreadMessages>>,
        ctx: &SyncObservationCtx<'_>,
    ) -> Result<Vec<ThreadSection>> {
        let system_prompt = build_multi_thread_observer_system_prompt();
        let run_one = |threads: &Vec<ThreadMessages>| -> Result<Vec<ThreadSection>> {
            let user_prompt = build_multi_thread_observer_user_prompt(
                Some(&record.active_observations),
                threads,
                ctx.skip_continuation_hints,
            );
            let reply = self.call_observer(ctx.abort, &system_prompt, &user_prompt)?;
            Ok(parse_multi_thread_output(&reply.text))
        };

        let parallelism = batch_parallelism(batches.len());
        if parallelism <= 1 {
            let mut sections = Vec::new();
            for threads in &batches {
                sections.extend(run_one(threads)?);
            }
            return Ok(sections);
        }

        let mut sections = Vec::new();
        let mut pending = batches.into_iter();
        loop {
            let wave: Vec<Vec<ThreadMessages>> = pending.by_ref().take(parallelism).collect();
            if wave.is_empty() {
                break;
            }
            let wave_sections = std::thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .iter()
                    .map(|threads| scope.spawn(|| run_one(threads)))
                    .collect();
                let mut out = Vec::new();
                for handle in handles {
                    let joined = handle.join().map_err(|_| {
                        MnemonError::Internal("multi-thread observer worker panicked".into())
                    })?;
                    out.push(joined?);
                }
                Ok::<Vec<Vec<ThreadSection>>, MnemonError>(out)
            })?;
            for batch_sections in wave_sections {
                sections.extend(batch_sections);
            }
        }
        Ok(sections)
    }
}

pub(crate) fn chunk_thread_batches(
    threads: &[ThreadMessages],
    max_tokens_per_batch: u32,
) -> Vec<Vec<ThreadMessages>> {
    let limit = max_tokens_per_batch.max(1);
    let mut batches = Vec::<Vec<ThreadMessages>>::new();
    let mut current = Vec::<ThreadMessages>::new();
    let mut current_tokens = 0u32;

    for thread in threads {
        let thread_tokens = approximate_text_tokens(&thread.message_history)
            .saturating_add(approximate_text_tokens(&thread.thread_id))
            .saturating_add(16);
        if !current.is_empty() && current_tokens.saturating_add(thread_tokens) > limit {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens = current_tokens.saturating_add(thread_tokens);
        current.push(thread.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn batch_parallelism(batch_count: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(MAX_BATCH_PARALLELISM);
    batch_count.clamp(1, available.clamp(1, MAX_BATCH_PARALLELISM))
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
