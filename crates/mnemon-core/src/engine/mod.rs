mod buffer;
mod inject;
mod observer;
mod reflector;
mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::agent::AgentCall;
use crate::config::{
    MemoryEngineOptions, ResolvedEngineConfig, resolve_engine_config,
};
use crate::error::{MnemonError, Result};
use crate::events::{DebugEvent, DebugEventSink, DebugEvents};
use crate::marker::MarkerPart;
use crate::models::{MemoryRecord, MemoryScope, Message};
use crate::store::{MemoryStore, RecordInit};
use crate::stream::StreamWriter;
use crate::token::TokenCounter;

pub use scheduler::{InputStepArgs, OutputResultArgs, ProcessedStep};

/// Cooperative cancellation checked before and after every LLM call.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(MnemonError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Per-turn bookkeeping threaded through the step calls of one agent turn.
#[derive(Debug, Default)]
pub struct TurnState {
    /// Message ids known persisted; excluded from the live session count.
    pub(crate) saved_ids: HashSet<String>,
    /// Ids that must be rewritten to fresh ids before any further persist,
    /// so sealed historical rows are never overwritten.
    pub(crate) sealed_ids: HashSet<String>,
}

impl TurnState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Completion gate for one background buffering run.
#[derive(Debug, Default)]
pub(crate) struct OpGate {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl OpGate {
    pub(crate) fn finish(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.condvar.notify_all();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.lock().map(|done| *done).unwrap_or(true)
    }

    /// Returns true when the op completed inside the timeout.
    pub(crate) fn wait(&self, timeout: std::time::Duration) -> bool {
        let Ok(mut done) = self.done.lock() else {
            return true;
        };
        let deadline = std::time::Instant::now() + timeout;
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = match self.condvar.wait_timeout(done, deadline - now) {
                Ok(pair) => pair,
                Err(_) => return true,
            };
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

pub(crate) struct EngineInner<S, A> {
    pub(crate) options: MemoryEngineOptions,
    pub(crate) resolved: ResolvedEngineConfig,
    pub(crate) store: S,
    pub(crate) agent: A,
    pub(crate) counter: TokenCounter,
    pub(crate) events: DebugEvents,
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// In-flight observation-buffering gates, one per scope key.
    pub(crate) buffer_ops: Mutex<HashMap<String, Arc<OpGate>>>,
    /// Scope keys with an in-flight reflection-buffering run.
    pub(crate) reflection_ops: Mutex<HashSet<String>>,
    /// Per-scope interval boundary mirror, reset on activation.
    pub(crate) last_buffered_boundary: Mutex<HashMap<String, u32>>,
    /// Cycle id of the buffered reflection per scope, to pair activation
    /// markers with their buffering markers.
    pub(crate) reflection_buffer_cycles: Mutex<HashMap<String, String>>,
}

impl<S: MemoryStore, A: AgentCall> EngineInner<S, A> {
    pub(crate) fn scope_lock(&self, scope_key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .scope_locks
            .lock()
            .map_err(|_| MnemonError::lock_poisoned("scope_locks"))?;
        Ok(locks
            .entry(scope_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    pub(crate) fn emit_marker(
        &self,
        writer: &dyn StreamWriter,
        scope_key: &str,
        marker: &MarkerPart,
    ) {
        let _ = writer.write_marker(marker);
        self.events.emit(DebugEvent::Marker {
            scope_key: scope_key.to_string(),
            marker: marker.clone(),
        });
    }

    pub(crate) fn load_record(
        &self,
        thread_id: &str,
        resource_id: Option<&str>,
    ) -> Result<MemoryRecord> {
        let scope_key = self.scope_key(thread_id, resource_id)?;
        self.store.initialize_record(RecordInit {
            scope: self.resolved.scope,
            scope_key: &scope_key,
            thread_id: Some(thread_id),
            resource_id,
        })
    }

    pub(crate) fn scope_key(&self, thread_id: &str, resource_id: Option<&str>) -> Result<String> {
        build_scope_key(self.resolved.scope, Some(thread_id), resource_id)
    }
}

pub fn build_scope_key(
    scope: MemoryScope,
    thread_id: Option<&str>,
    resource_id: Option<&str>,
) -> Result<String> {
    match scope {
        MemoryScope::Thread => thread_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("thread:{value}"))
            .ok_or_else(|| MnemonError::InvalidScope("thread scope requires a thread id".into())),
        MemoryScope::Resource => resource_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("resource:{value}"))
            .ok_or_else(|| {
                MnemonError::InvalidScope("resource scope requires a resource id".into())
            }),
    }
}

/// The Observational Memory engine facade.
///
/// One instance per process per configuration. Re-entrant across scopes,
/// serialized within a scope.
pub struct MemoryEngine<S, A> {
    pub(crate) inner: Arc<EngineInner<S, A>>,
}

impl<S, A> Clone for MemoryEngine<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: MemoryStore, A: AgentCall> std::fmt::Debug for MemoryEngine<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("scope", &self.inner.resolved.scope)
            .finish_non_exhaustive()
    }
}

impl<S: MemoryStore + 'static, A: AgentCall + 'static> MemoryEngine<S, A> {
    /// Construction fails on configuration errors; nothing else is fatal
    /// this early.
    pub fn new(options: MemoryEngineOptions, store: S, agent: A) -> Result<Self> {
        Self::with_debug_sink(options, store, agent, None)
    }

    pub fn with_debug_sink(
        options: MemoryEngineOptions,
        store: S,
        agent: A,
        debug_sink: Option<DebugEventSink>,
    ) -> Result<Self> {
        let resolved = resolve_engine_config(&options)
            .map_err(|err| MnemonError::Validation(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                options,
                resolved,
                store,
                agent,
                counter: TokenCounter::new(),
                events: DebugEvents::new(debug_sink),
                scope_locks: Mutex::new(HashMap::new()),
                buffer_ops: Mutex::new(HashMap::new()),
                reflection_ops: Mutex::new(HashSet::new()),
                last_buffered_boundary: Mutex::new(HashMap::new()),
                reflection_buffer_cycles: Mutex::new(HashMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MemoryEngineOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn resolved_config(&self) -> &ResolvedEngineConfig {
        &self.inner.resolved
    }

    pub fn get_record(
        &self,
        thread_id: &str,
        resource_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let scope_key = self.inner.scope_key(thread_id, resource_id)?;
        self.inner.store.get_record(&scope_key)
    }

    pub fn get_observations(
        &self,
        thread_id: &str,
        resource_id: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(self
            .get_record(thread_id, resource_id)?
            .map(|record| record.active_observations)
            .filter(|text| !text.trim().is_empty()))
    }

    pub fn get_history(&self, thread_id: &str) -> Result<Vec<Message>> {
        self.inner.store.list_thread_messages(thread_id, None)
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<crate::models::Thread>> {
        self.inner.store.get_thread(thread_id)
    }

    /// Forgets the scope's memory. Messages and threads survive.
    pub fn clear(&self, thread_id: &str, resource_id: Option<&str>) -> Result<()> {
        let scope_key = self.inner.scope_key(thread_id, resource_id)?;
        self.inner.store.clear_scope(&scope_key)
    }
}
