//! Low-level POSIX shared memory operations
//!
//! Every named object in this crate (ring regions and signals) lives in its own
//! POSIX shared memory segment. Segments are created by whichever process opens
//! the name first and unlinked by whichever process releases it last; the
//! reference count lives in a small header at the start of the mapping.

use crate::error::{IpcError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

const SHM_PREFIX: &str = "/cmdr_";
pub(crate) const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Written last by the creator; openers wait for it before trusting the header
const REGION_MAGIC: u32 = 0x434D_4452; // "CMDR"

/// Cache line size, also the header size
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// How often openers re-check a region that is still being set up or torn down
const SETTLE_INTERVAL: Duration = Duration::from_millis(1);
const SETTLE_ATTEMPTS: u32 = 2000;

/// Header stored at the beginning of every segment
#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    refs: AtomicU32,
    payload_size: AtomicU64,
    _pad: [u8; CACHE_LINE_SIZE - 16],
}

/// Round `size` up to a whole cache line
#[inline]
pub(crate) const fn align_up(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Handle to a reference-counted shared memory region
pub struct SharedRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    mapped: usize,
    payload_size: usize,
    name: String,
    created: bool,
}

// SAFETY: the mapping stays valid for the lifetime of the handle and all
// cross-process state inside it is accessed through atomics or under a lock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Open the region `name`, creating it with `payload_size` bytes if needed.
    ///
    /// `init` runs only in the creating process, before any other process can
    /// observe the region; it receives a pointer to the zeroed payload.
    pub fn create_or_open<F>(name: &str, payload_size: usize, init: F) -> Result<Self>
    where
        F: FnOnce(*mut u8),
    {
        let c_name = os_name(name)?;

        for _ in 0..SETTLE_ATTEMPTS {
            match shm_open(
                c_name.as_c_str(),
                ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
                Mode::RUSR | Mode::WUSR,
            ) {
                Ok(fd) => return Self::create(fd, &c_name, name, payload_size, init),
                Err(Errno::EXIST) => {}
                Err(e) => {
                    return Err(IpcError::ShmCreate {
                        name: name.to_string(),
                        source: e.into(),
                    })
                }
            }

            match Self::open(&c_name, name, payload_size)? {
                Some(region) => return Ok(region),
                // Either still being created or on its way out; try again
                None => thread::sleep(SETTLE_INTERVAL),
            }
        }

        Err(IpcError::ShmOpen {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "region never settled"),
        })
    }

    fn create<F>(fd: OwnedFd, c_name: &CString, name: &str, payload_size: usize, init: F) -> Result<Self>
    where
        F: FnOnce(*mut u8),
    {
        let mapped = CACHE_LINE_SIZE + payload_size;

        // Any failure past this point must not leave a half-built name behind
        let unlink_on_err = |e: IpcError| {
            let _ = shm_unlink(c_name.as_c_str());
            e
        };

        ftruncate(&fd, mapped as u64)
            .map_err(|e| unlink_on_err(IpcError::Truncate(e.into())))?;
        let addr = map(&fd, mapped).map_err(unlink_on_err)?;

        let header = addr.as_ptr() as *mut RegionHeader;
        // SAFETY: the mapping is at least one header long, zero-filled by
        // ftruncate, and invisible to other processes until magic is set.
        unsafe {
            (*header).payload_size.store(payload_size as u64, Ordering::Relaxed);
            (*header).refs.store(1, Ordering::Relaxed);
            init(addr.as_ptr().add(CACHE_LINE_SIZE));
            (*header).magic.store(REGION_MAGIC, Ordering::Release);
        }

        debug!(name, payload_size, "created shared region");

        Ok(Self {
            fd,
            addr,
            mapped,
            payload_size,
            name: name.to_string(),
            created: true,
        })
    }

    /// Returns `Ok(None)` when the region exists but is not usable yet (or anymore).
    fn open(c_name: &CString, name: &str, payload_size: usize) -> Result<Option<Self>> {
        let fd = match shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            // Unlinked between our create attempt and this open
            Err(Errno::NOENT) => return Ok(None),
            Err(e) => {
                return Err(IpcError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
        };

        let stat = rustix::fs::fstat(&fd).map_err(|e| IpcError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size < CACHE_LINE_SIZE {
            // Creator has not sized it yet
            return Ok(None);
        }

        let addr = map(&fd, size)?;
        let unmap = |addr: NonNull<u8>| {
            // SAFETY: addr/size come from the successful mmap above.
            unsafe {
                let _ = munmap(addr.as_ptr().cast(), size);
            }
        };

        // SAFETY: the mapping is at least one header long.
        let header = unsafe { &*(addr.as_ptr() as *const RegionHeader) };
        if header.magic.load(Ordering::Acquire) != REGION_MAGIC {
            unmap(addr);
            return Ok(None);
        }

        let recorded = header.payload_size.load(Ordering::Relaxed);
        if recorded != payload_size as u64 {
            unmap(addr);
            return Err(IpcError::IncompatibleRegion {
                name: name.to_string(),
                expected: payload_size as u64,
                got: recorded,
            });
        }

        // A zero count means the last holder is about to unlink it
        let mut refs = header.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                unmap(addr);
                return Ok(None);
            }
            match header
                .refs
                .compare_exchange_weak(refs, refs + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => refs = current,
            }
        }

        trace!(name, refs = refs + 1, "opened shared region");

        Ok(Some(Self {
            fd,
            addr,
            mapped: size,
            payload_size,
            name: name.to_string(),
            created: false,
        }))
    }

    /// Get raw pointer to the payload (past the header)
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping is always header + payload long.
        unsafe { self.addr.as_ptr().add(CACHE_LINE_SIZE) }
    }

    /// Get size of the payload in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.payload_size
    }

    /// Get the name of the region
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created the region
    #[inline(always)]
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Number of processes (handles) currently holding the region
    pub fn holders(&self) -> u32 {
        self.header().refs.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping starts with an initialized header.
        unsafe { &*(self.addr.as_ptr() as *const RegionHeader) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let last = self.header().refs.fetch_sub(1, Ordering::AcqRel) == 1;

        // Unmap memory
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.mapped);
        }

        // Last holder unlinks the name
        if last {
            if let Ok(c_name) = os_name(&self.name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
            debug!(name = %self.name, "destroyed shared region");
        }
    }
}

/// Map `size` bytes of `fd` read/write and shared
fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping of our own fd; no existing memory is aliased.
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| IpcError::Mmap(e.into()))?
    };

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| IpcError::Mmap(io::Error::new(io::ErrorKind::Other, "mmap returned null")))
}

/// Build the OS-level object name for `name`
///
/// POSIX shm names are a single path component, so separators in the caller's
/// identifier are folded into underscores.
pub(crate) fn os_name(name: &str) -> Result<CString> {
    if name.is_empty() || name.contains('\0') {
        return Err(IpcError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(IpcError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }

    let full_name = format!("{}{}", SHM_PREFIX, name.replace('/', "_"));
    CString::new(full_name).map_err(|_| IpcError::InvalidName(name.to_string()))
}
