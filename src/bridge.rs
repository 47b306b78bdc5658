//! Cancellation bridge for blocking OS calls.
//!
//! Accept and connect block inside the kernel with no way to cancel them
//! directly. A [`CancelBridge`] registers a "force-abort" action (typically:
//! shut down or close the handle) against a [`CancellationToken`] and tracks a
//! three-state machine so that exactly one of two things happens:
//!
//! - the token fires first: the abort action runs, and `complete()` later
//!   reports the loss so the caller discards whatever the call produced;
//! - the call finishes first: `complete()` wins, the abort action is
//!   deregistered and can no longer touch a handle that is now in use.

use crate::cancel::{CancellationToken, Registration};
use crate::error::{IpcError, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// Where a bridged operation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Completed,
    Cancelled,
}

struct Shared<R> {
    phase: AtomicU8,
    resource: R,
}

/// Ties a resource's force-abort action to a cancellation token.
pub struct CancelBridge<R> {
    shared: Arc<Shared<R>>,
    registration: Mutex<Option<Registration>>,
}

impl<R> CancelBridge<R>
where
    R: Send + Sync + 'static,
{
    /// Bridge `resource` to `token`, running `abort(&resource)` if the token
    /// fires before [`complete`](Self::complete).
    ///
    /// A token that cannot be cancelled short-circuits to `Completed` and
    /// registers nothing. A token that already fired aborts immediately.
    pub fn new<F>(resource: R, abort: F, token: &CancellationToken) -> Self
    where
        F: FnOnce(&R) + Send + 'static,
    {
        let initial = if token.can_be_cancelled() {
            PENDING
        } else {
            COMPLETED
        };
        let shared = Arc::new(Shared {
            phase: AtomicU8::new(initial),
            resource,
        });

        if initial == COMPLETED {
            return Self {
                shared,
                registration: Mutex::new(None),
            };
        }

        let registration = {
            let shared = Arc::clone(&shared);
            token.register(move || {
                if shared
                    .phase
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    abort(&shared.resource);
                }
            })
        };

        Self {
            shared,
            registration: Mutex::new(Some(registration)),
        }
    }

    /// Mark the operation as finished normally.
    ///
    /// Returns `true` if completion won (or had already won), `false` if
    /// cancellation got there first. Calling it again is a no-op.
    pub fn complete(&self) -> bool {
        let won = match self.shared.phase.compare_exchange(
            PENDING,
            COMPLETED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == COMPLETED,
        };

        if won {
            // Deregister so a late cancel cannot reach a reused handle
            let registration = self
                .registration
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            drop(registration);
        }
        won
    }

    /// Current state
    pub fn phase(&self) -> Phase {
        match self.shared.phase.load(Ordering::Acquire) {
            PENDING => Phase::Pending,
            COMPLETED => Phase::Completed,
            _ => Phase::Cancelled,
        }
    }

    /// Whether cancellation won
    pub fn is_cancelled(&self) -> bool {
        self.phase() == Phase::Cancelled
    }

    /// The bridged resource
    pub fn resource(&self) -> &R {
        &self.shared.resource
    }
}

/// Raises an abort flag if the owning future is dropped before it finishes
struct AbortOnDrop<N: Fn()> {
    flag: Arc<AtomicBool>,
    nudge: Arc<N>,
    armed: bool,
}

impl<N: Fn()> Drop for AbortOnDrop<N> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
            (*self.nudge)();
        }
    }
}

/// Run a blocking operation on tokio's blocking pool, bridged to `token`.
///
/// `op` receives an abort flag; cancellation raises it and then calls `nudge`
/// so a thread parked on some OS primitive re-checks the flag. If cancellation
/// wins, whatever `op` produced is dropped (closing it) and `Cancelled` is
/// returned. The blocking call is joined before this returns; dropping the
/// future early raises the flag too, so the call still ends promptly.
pub(crate) async fn run_blocking<T, N, F>(token: &CancellationToken, nudge: N, op: F) -> Result<T>
where
    T: Send + 'static,
    N: Fn() + Send + Sync + 'static,
    F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
{
    token.check()?;

    let abort = Arc::new(AtomicBool::new(false));
    let nudge = Arc::new(nudge);
    let bridge = CancelBridge::new(
        (Arc::clone(&abort), Arc::clone(&nudge)),
        |(flag, nudge): &(Arc<AtomicBool>, Arc<N>)| {
            flag.store(true, Ordering::Release);
            (**nudge)();
        },
        token,
    );
    let mut guard = AbortOnDrop {
        flag: Arc::clone(&abort),
        nudge,
        armed: true,
    };

    let result = tokio::task::spawn_blocking(move || op(abort.as_ref())).await;
    guard.armed = false;

    let result = result?;
    if !bridge.complete() {
        drop(result);
        return Err(IpcError::Cancelled);
    }
    result
}
