//! Cooperative cancellation with register-callback semantics.
//!
//! A [`CancellationSource`] owns the cancel transition; every
//! [`CancellationToken`] cloned from it observes that transition. Tokens
//! support three consumption styles:
//!
//! - polling via [`CancellationToken::is_cancelled`],
//! - registering a callback via [`CancellationToken::register`],
//! - awaiting [`CancellationToken::cancelled`] inside `tokio::select!`.
//!
//! Callbacks registered before `cancel()` fire in registration order on the
//! thread that called `cancel()`; callbacks registered after fire
//! synchronously on the registering thread. Child tokens created with
//! [`CancellationToken::child_token`] cancel when their parent cancels;
//! children never propagate upward.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send>;

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    cancelled: bool,
    callbacks: Vec<Callback>,
}

/// Owner side of a cancellation pair.
///
/// Dropping the source does not cancel; cancellation is always explicit.
pub struct CancellationSource {
    shared: Arc<Shared>,
}

/// Observer side of a cancellation pair. Cheap to clone.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationSource {
    /// Creates a new, live source.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    cancelled: false,
                    callbacks: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Transitions from live to cancelled. Idempotent.
    ///
    /// Callbacks registered so far run in registration order on the calling
    /// thread before this returns.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.shared.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        self.shared.notify.notify_waiters();
    }

    /// Returns true once [`CancellationSource::cancel`] has run.
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Returns a token that can never be cancelled.
    pub fn never() -> Self {
        CancellationSource::new().token()
    }

    /// Returns true once the owning source has cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Registers a callback to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs synchronously on
    /// the current thread before this returns.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.shared.state.lock();
            if state.cancelled {
                true
            } else {
                state.callbacks.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Creates a child token that cancels when this token cancels.
    ///
    /// Cancelling the returned source does not affect this token.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationSource::new();
        let token = child.token();
        self.register(move || child.cancel());
        token
    }

    /// Completes when the owning source cancels.
    ///
    /// Safe to call from multiple tasks; resolves immediately if already
    /// cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // Re-check after arming the waiter to close the cancel-before-wait gap.
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_token_starts_live() {
        let source = CancellationSource::new();
        assert!(!source.is_cancelled());
        assert!(!source.token().is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        source.token().register(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        source.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(source.token().is_cancelled());
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let source = CancellationSource::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            source.token().register(move || order.lock().push(i));
        }

        source.cancel();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_register_after_cancel_fires_synchronously() {
        let source = CancellationSource::new();
        source.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        source.token().register(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_cancels_with_parent() {
        let parent = CancellationSource::new();
        let child = parent.token().child_token();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_does_not_propagate_upward() {
        let parent = CancellationSource::new();

        // Link a standalone child source under the parent, then cancel the
        // child side directly.
        let child = Arc::new(CancellationSource::new());
        let child_token = child.token();
        {
            let child = Arc::clone(&child);
            parent.token().register(move || child.cancel());
        }

        child.cancel();
        assert!(child_token.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let source = CancellationSource::new();
        let token = source.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        let resolved = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() should resolve")
            .expect("task should not panic");
        assert!(resolved);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_immediately_when_already_cancelled() {
        let source = CancellationSource::new();
        source.cancel();

        let token = source.token();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token should resolve immediately");
    }

    #[test]
    fn test_never_token() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
    }
}
