use std::sync::Mutex;

use crate::error::Result;
use crate::marker::MarkerPart;

/// Receives marker data parts as the engine emits them, so a UI can render
/// observation progress alongside the streamed turn.
pub trait StreamWriter: Send + Sync {
    fn write_marker(&self, marker: &MarkerPart) -> Result<()>;
}

/// Discards every marker. Used by headless callers and background work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStreamWriter;

impl StreamWriter for NullStreamWriter {
    fn write_marker(&self, _marker: &MarkerPart) -> Result<()> {
        Ok(())
    }
}

/// Buffers every marker in order. Primarily a test double.
#[derive(Debug, Default)]
pub struct CollectingStreamWriter {
    markers: Mutex<Vec<MarkerPart>>,
}

impl CollectingStreamWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<MarkerPart> {
        self.markers
            .lock()
            .map(|mut markers| std::mem::take(&mut *markers))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<MarkerPart> {
        self.markers
            .lock()
            .map(|markers| markers.clone())
            .unwrap_or_default()
    }
}

impl StreamWriter for CollectingStreamWriter {
    fn write_marker(&self, marker: &MarkerPart) -> Result<()> {
        if let Ok(mut markers) = self.markers.lock() {
            markers.push(marker.clone());
        }
        Ok(())
    }
}
