//! Named, process-shared signals
//!
//! A [`NamedSignal`] is a single futex word in its own shared region. It behaves
//! like an auto-reset event: `set` raises it, and exactly one `wait`/`try_take`
//! consumes it. Created with an initial state of "set", the same object is a
//! binary semaphore, which is how the ring channels get their mutual exclusion
//! ([`NamedSignal::lock`] returns a scoped guard).

use crate::error::{IpcError, Result};
use crate::futex;
use crate::shm::SharedRegion;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const UNSET: u32 = 0;
const SET: u32 = 1;

/// Upper bound on a single futex sleep while an abort flag or peer check is pending
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(20);

/// An auto-reset event shared between processes by name
pub struct NamedSignal {
    region: SharedRegion,
}

impl NamedSignal {
    /// Open the signal `name`, creating it in state `initially_set` if needed.
    ///
    /// The initial state only applies when this call creates the object.
    pub fn create_or_open(name: &str, initially_set: bool) -> Result<Self> {
        let initial = if initially_set { SET } else { UNSET };
        let region = SharedRegion::create_or_open(name, std::mem::size_of::<AtomicU32>(), |p| {
            // SAFETY: payload is cache-line aligned and at least 4 bytes.
            unsafe { (*(p as *const AtomicU32)).store(initial, Ordering::Relaxed) }
        })?;
        Ok(Self { region })
    }

    #[inline(always)]
    fn word(&self) -> &AtomicU32 {
        // SAFETY: the payload holds exactly one aligned AtomicU32.
        unsafe { &*(self.region.as_ptr() as *const AtomicU32) }
    }

    /// Raise the signal and wake any waiter
    #[inline]
    pub fn set(&self) {
        self.word().store(SET, Ordering::Release);
        futex::wake_all(self.word());
    }

    /// Lower the signal without waking anyone
    #[inline]
    pub fn reset(&self) {
        self.word().store(UNSET, Ordering::Release);
    }

    /// Consume the signal if it is raised
    #[inline]
    pub fn try_take(&self) -> bool {
        self.word()
            .compare_exchange(SET, UNSET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check the state without consuming it
    #[inline]
    pub fn is_set(&self) -> bool {
        self.word().load(Ordering::Acquire) == SET
    }

    /// Block until the signal is raised, then consume it
    pub fn wait(&self) {
        while !self.try_take() {
            futex::wait(self.word(), UNSET, None);
        }
    }

    /// Wait with a deadline; returns `false` on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_take() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            futex::wait(self.word(), UNSET, Some(deadline - now));
        }
    }

    /// Wait until raised or until `abort` becomes true.
    ///
    /// Returns `Err(Cancelled)` when aborted; the signal is left untouched then.
    pub fn wait_or_abort(&self, abort: &AtomicBool) -> Result<()> {
        loop {
            if abort.load(Ordering::Acquire) {
                return Err(IpcError::Cancelled);
            }
            if self.try_take() {
                return Ok(());
            }
            futex::wait(self.word(), UNSET, Some(POLL_SLICE));
        }
    }

    /// Wake waiters without changing state so they re-check their abort flags
    #[inline]
    pub fn nudge(&self) {
        futex::wake_all(self.word());
    }

    /// Acquire as a binary semaphore; released when the guard drops
    #[inline]
    pub fn lock(&self) -> SignalGuard<'_> {
        self.wait();
        SignalGuard { signal: self }
    }

    /// Name the signal was opened with
    pub fn name(&self) -> &str {
        self.region.name()
    }
}

/// Scoped hold on a [`NamedSignal`] used as a mutex
pub struct SignalGuard<'a> {
    signal: &'a NamedSignal,
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        self.signal.set();
    }
}
