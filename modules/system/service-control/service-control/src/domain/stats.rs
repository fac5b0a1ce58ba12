//! Allow/deny counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-filter counters, shared by every request.
#[derive(Debug, Default)]
pub struct FilterStats {
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl FilterStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}
