//! Cancellation handle returned by token fetches and outbound calls.

use std::fmt;

/// Cancels one pending token fetch or outbound call.
///
/// Cancelling suppresses the completion callback of the operation it was
/// returned for. Calling [`CancelHandle::cancel`] more than once, or after the
/// operation already completed, is a no-op.
///
/// Dropping a handle does **not** cancel: fire-and-forget callers simply let
/// the handle go.
#[must_use = "dropping a CancelHandle does not cancel the operation"]
pub struct CancelHandle {
    on_cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CancelHandle {
    /// Create a handle that runs `on_cancel` the first time it is cancelled.
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// A handle for an operation that already completed.
    pub fn noop() -> Self {
        Self { on_cancel: None }
    }

    /// Cancel the operation. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }

    /// Whether a later [`CancelHandle::cancel`] would still do anything.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.on_cancel.is_some()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_runs_action_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_armed());
        handle.cancel();
        handle.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.is_armed());
    }

    #[test]
    fn dropping_does_not_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn noop_handle_is_disarmed() {
        let mut handle = CancelHandle::noop();
        assert!(!handle.is_armed());
        handle.cancel();
    }
}
