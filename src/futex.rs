//! Cross-process futex wait/wake on words inside shared memory.
//!
//! Only the shared (non-private) futex operations are used, so a wake issued by
//! one process reaches waiters in every process mapping the same segment.
//! Platforms without futexes fall back to short sleeps; callers always re-check
//! their condition after `wait` returns, so the fallback only costs latency.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout` (forever if `None`).
///
/// May return early and spuriously.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` is a live, aligned u32; the kernel only reads it and the
    // optional timespec. EAGAIN/EINTR/ETIMEDOUT are all fine to ignore here.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        );
    }
}

/// Wake every waiter blocked on `word`, in any process.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn wake_all(word: &AtomicU32) {
    // SAFETY: FUTEX_WAKE never dereferences beyond the futex word itself.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FALLBACK_SLICE: Duration = Duration::from_millis(1);

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) == expected {
        let slice = timeout.map_or(FALLBACK_SLICE, |t| t.min(FALLBACK_SLICE));
        std::thread::sleep(slice);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn wake_all(_word: &AtomicU32) {}
