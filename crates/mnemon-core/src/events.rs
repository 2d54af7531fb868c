use std::sync::Arc;

use crate::marker::MarkerPart;

/// Structured diagnostics surfaced to the embedding application. Every
/// marker the engine emits is mirrored here, plus conditions that never
/// reach the stream (skipped buffering runs, swallowed background errors).
#[derive(Debug, Clone)]
pub enum DebugEvent {
    Marker {
        scope_key: String,
        marker: MarkerPart,
    },
    BufferingSkipped {
        scope_key: String,
        reason: &'static str,
    },
    BackgroundError {
        scope_key: String,
        error: String,
    },
}

pub type DebugEventSink = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct DebugEvents {
    sink: Option<DebugEventSink>,
}

impl std::fmt::Debug for DebugEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugEvents")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

impl DebugEvents {
    #[must_use]
    pub fn new(sink: Option<DebugEventSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: DebugEvent) {
        if let Some(sink) = &self.sink {
            sink(&event);
        }
    }
}
