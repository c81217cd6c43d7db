//! Transfer progress reporting.
//!
//! A [`ProgressSink`] receives one [`ProgressUpdate`] per chunk a transfer
//! moves and can ask the transfer to stop. Progress is advisory: nothing in
//! the engine makes decisions from the percentages.

use tracing::trace;

/// Observer of a running transfer.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);

    /// Polled once per chunk; returning `true` cancels the transfer.
    fn cancel_requested(&self) -> bool {
        false
    }
}

/// Snapshot emitted after each chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub bytes_transferred: u64,
    /// Source size from `lstat`; `0` when unknown.
    pub total_bytes: u64,
    /// Share of the total this chunk represents.
    pub increment_percent: f64,
    pub percent: f64,
    pub message: String,
}

/// Turns chunk sizes into [`ProgressUpdate`]s against a known total.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    total: u64,
    transferred: u64,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            transferred: 0,
        }
    }

    /// Record `len` more bytes.
    pub fn advance(&mut self, len: usize) -> ProgressUpdate {
        self.transferred = self.transferred.saturating_add(len as u64);
        let (increment_percent, percent) = if self.total == 0 {
            (0.0, 0.0)
        } else {
            let total = self.total as f64;
            (
                len as f64 * 100.0 / total,
                self.transferred as f64 * 100.0 / total,
            )
        };
        ProgressUpdate {
            bytes_transferred: self.transferred,
            total_bytes: self.total,
            increment_percent,
            percent,
            message: format!("transfer... {percent:.2}%"),
        }
    }
}

/// Sink that writes every update to the `trace` log.
#[derive(Debug, Clone, Default)]
pub struct TracingProgress {
    label: String,
}

impl TracingProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for TracingProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        trace!(
            file = %self.label,
            bytes = update.bytes_transferred,
            total = update.total_bytes,
            "{}",
            update.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_reports_cumulative_percent() {
        let mut tracker = ProgressTracker::new(200);
        let first = tracker.advance(50);
        assert_eq!(first.bytes_transferred, 50);
        assert_eq!(first.increment_percent, 25.0);
        assert_eq!(first.percent, 25.0);
        assert_eq!(first.message, "transfer... 25.00%");

        let second = tracker.advance(150);
        assert_eq!(second.percent, 100.0);
        assert_eq!(second.increment_percent, 75.0);
        assert_eq!(second.bytes_transferred, 200);
    }

    #[test]
    fn unknown_total_reports_zero_percent() {
        let mut tracker = ProgressTracker::new(0);
        let update = tracker.advance(4096);
        assert_eq!(update.bytes_transferred, 4096);
        assert_eq!(update.percent, 0.0);
        assert_eq!(update.increment_percent, 0.0);
        assert_eq!(update.message, "transfer... 0.00%");
    }

    #[test]
    fn default_sink_never_cancels() {
        let sink = TracingProgress::new("a.txt");
        sink.on_progress(&ProgressTracker::new(1).advance(1));
        assert!(!sink.cancel_requested());
    }
}
