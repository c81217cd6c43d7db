use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ferry_core::progress::{ProgressSink, ProgressUpdate, TracingProgress};
use tracing::info;

/// Progress sink for one CLI transfer.
///
/// All sinks of a run share `interrupted`, which the Ctrl-C handler sets.
pub struct CliProgress {
    label: String,
    chunks: TracingProgress,
    interrupted: Arc<AtomicBool>,
}

impl CliProgress {
    pub fn new(label: impl Into<String>, interrupted: Arc<AtomicBool>) -> Self {
        let label = label.into();
        Self {
            chunks: TracingProgress::new(label.clone()),
            label,
            interrupted,
        }
    }
}

impl ProgressSink for CliProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        if update.total_bytes > 0 && update.bytes_transferred >= update.total_bytes {
            info!(file = %self.label, bytes = update.bytes_transferred, "transferred");
        } else {
            self.chunks.on_progress(update);
        }
    }

    fn cancel_requested(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
