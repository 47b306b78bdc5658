//! Cooperative cancellation signal.
//!
//! A [`CancellationToken`] is a shared flag that code can poll, await, or
//! register callbacks against. Callbacks are what let a cancellation reach
//! into blocking OS calls that have no native cancellation (see
//! [`crate::bridge`]).

use crate::error::{IpcError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
    notify: Notify,
}

impl Inner {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        // A panicking callback never runs under this lock, so poisoning is benign
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A cancellation token shared across threads and tasks.
///
/// Cloning shares state: cancelling any clone cancels all of them. A token made
/// with [`CancellationToken::none`] (also the `Default`) can never be cancelled.
///
/// # Example
///
/// ```
/// use commander_ipc::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Inner::default())),
        }
    }

    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Whether this token can ever fire.
    pub fn can_be_cancelled(&self) -> bool {
        self.inner.is_some()
    }

    /// Request cancellation.
    ///
    /// Registered callbacks run on the calling thread, exactly once.
    pub fn cancel(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries = std::mem::take(&mut inner.callbacks().entries);
        for (_, callback) in entries {
            callback();
        }
        inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.cancelled.load(Ordering::Acquire))
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IpcError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once the token is cancelled (never, for [`none`](Self::none)).
    pub async fn cancelled(&self) {
        let Some(inner) = &self.inner else {
            return std::future::pending().await;
        };

        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if inner.cancelled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Run `callback` when the token is cancelled.
    ///
    /// If it already is, `callback` runs immediately. Dropping the returned
    /// registration before cancellation removes the callback unrun.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            return Registration { slot: None };
        };

        let mut callbacks = inner.callbacks();
        if inner.cancelled.load(Ordering::Acquire) {
            drop(callbacks);
            callback();
            return Registration { slot: None };
        }

        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, Box::new(callback)));

        Registration {
            slot: Some((Arc::downgrade(inner), id)),
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle for a callback registered with [`CancellationToken::register`].
///
/// Dropping it deregisters the callback.
#[must_use = "dropping a Registration immediately deregisters its callback"]
pub struct Registration {
    slot: Option<(std::sync::Weak<Inner>, u64)>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some((inner, id)) = self.slot.take() else {
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        // Move the callback out so it is dropped outside the lock
        let removed = {
            let mut callbacks = inner.callbacks();
            callbacks
                .entries
                .iter()
                .position(|(entry, _)| *entry == id)
                .map(|index| callbacks.entries.swap_remove(index))
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.can_be_cancelled());
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert!(token2.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_none_never_cancels() {
        let token = CancellationToken::none();
        token.cancel();
        assert!(!token.can_be_cancelled());
        assert!(!token.is_cancelled());

        let (hits, callback) = counter();
        let _registration = token.register(callback);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_runs_once_on_cancel() {
        let token = CancellationToken::new();
        let (hits, callback) = counter();
        let _registration = token.register(callback);

        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let (hits, callback) = counter();
        let _registration = token.register(callback);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_fire() {
        let token = CancellationToken::new();
        let (hits, callback) = counter();
        drop(token.register(callback));

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancelled() did not resolve")
            .unwrap();
    }
}
