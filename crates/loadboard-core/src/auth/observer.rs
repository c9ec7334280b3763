use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::api::RenewalFailure;

/// Why the session was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReason {
    pub failure: RenewalFailure,
}

type Callback = Arc<dyn Fn(&InvalidationReason) + Send + Sync>;

/// Notification sink fired when the session can no longer be renewed.
///
/// The credential store has already been cleared when callbacks run.
/// Typical callbacks send the user back to the sign-in screen.
#[derive(Default)]
pub struct SessionObserver {
    callbacks: Mutex<Vec<Callback>>,
    invalidations: AtomicU64,
}

impl SessionObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_invalidated<F>(&self, callback: F)
    where
        F: Fn(&InvalidationReason) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Invoke every registered callback once.
    pub fn notify_invalidated(&self, reason: InvalidationReason) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        info!(reason = %reason.failure, "Session invalidated");

        // Callbacks may register further callbacks
        let callbacks: Vec<Callback> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(&reason);
        }
    }

    /// Number of invalidation events so far.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_calls_each_callback_once() {
        let observer = SessionObserver::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            observer.on_invalidated(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        observer.notify_invalidated(InvalidationReason {
            failure: RenewalFailure::TimedOut,
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(observer.invalidation_count(), 1);
    }

    #[test]
    fn test_notify_without_callbacks() {
        let observer = SessionObserver::new();
        observer.notify_invalidated(InvalidationReason {
            failure: RenewalFailure::MissingRefreshToken,
        });
        assert_eq!(observer.invalidation_count(), 1);
    }
}
