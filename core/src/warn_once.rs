//! Process-wide "log this warning at most once" flags.

use std::sync::atomic::{AtomicBool, Ordering};

/// A flag that lets exactly one caller through for the life of the process.
#[derive(Debug)]
pub struct WarnOnce {
    warned: AtomicBool,
}

impl WarnOnce {
    pub const fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    /// `true` for the first caller only.
    pub fn first(&self) -> bool {
        !self.warned.swap(true, Ordering::AcqRel)
    }

    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Acquire)
    }
}

impl Default for WarnOnce {
    fn default() -> Self {
        Self::new()
    }
}

/// Set once `futimes` has been refused on any transfer.
pub static TIMESTAMP_PERMISSION: WarnOnce = WarnOnce::new();
