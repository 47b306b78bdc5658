//! Shared-memory ring stream
//!
//! A connection's region holds two independent ring channels, one per
//! direction. Each channel keeps its `start`/`count` cursors inside the region
//! and is guarded by three named signals: a lock, "data available" and "space
//! available". The cursors are only touched while the lock is held; blocking
//! only ever happens on the data/space signals, outside the lock.
//!
//! # Layout
//!
//! ```text
//! [stream header][channel 0 header][channel 0 data][pad][channel 1 header][channel 1 data]
//! ```
//!
//! Channel 0 carries client-to-server bytes, channel 1 server-to-client bytes.

use crate::error::{IpcError, Result};
use crate::shm::{align_up, SharedRegion, CACHE_LINE_SIZE};
use crate::signal::{NamedSignal, POLL_SLICE};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Default capacity of each direction: 64 KiB minus the two cursor fields
pub const DEFAULT_CAPACITY: u64 = 0x10000 - 2 * std::mem::size_of::<u64>() as u64;

const LOCK_SUFFIX: &str = "L";
const DATA_SUFFIX: &str = "E";
const SPACE_SUFFIX: &str = "F";

/// How long a new connection waits for a previous one on the same name to finish
const STALE_REGION_WAIT: Duration = Duration::from_secs(5);

/// Which end of a connection this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    #[inline]
    fn bit(self) -> u32 {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }

    #[inline]
    fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }

    /// (channel I read from, channel I write to)
    #[inline]
    fn channels(self) -> (usize, usize) {
        match self {
            Role::Server => (0, 1),
            Role::Client => (1, 0),
        }
    }
}

/// Per-connection bookkeeping at the start of the region
#[repr(C)]
struct StreamHeader {
    attached: AtomicU32,
    departed: AtomicU32,
    _pad: [u8; CACHE_LINE_SIZE - 8],
}

/// Per-channel cursors, stored in shared memory
#[repr(C)]
struct ChannelHeader {
    capacity: AtomicU64,
    start: AtomicU64,
    count: AtomicU64,
    _pad: [u8; CACHE_LINE_SIZE - 24],
}

/// Split a run of `len` bytes starting at `pos` into at most two contiguous
/// ranges of a ring of size `capacity`. The second range is empty unless the
/// run crosses the physical end of the buffer.
#[inline]
pub(crate) fn split_run(capacity: usize, pos: usize, len: usize) -> (Range<usize>, Range<usize>) {
    let first = len.min(capacity - pos);
    (pos..pos + first, 0..len - first)
}

/// Byte offsets of the two channels and the total payload size
fn layout(capacity0: usize, capacity1: usize) -> ([usize; 2], usize) {
    let channel0 = CACHE_LINE_SIZE;
    let channel1 = channel0 + align_up(CACHE_LINE_SIZE + capacity0);
    let total = channel1 + CACHE_LINE_SIZE + capacity1;
    ([channel0, channel1], total)
}

/// One direction of a connection
struct RingChannel {
    header: *const ChannelHeader,
    data: *mut u8,
    capacity: usize,
    lock: NamedSignal,
    data_ready: NamedSignal,
    space_ready: NamedSignal,
}

impl RingChannel {
    /// # Safety
    /// `base` must point at an initialized channel header followed by
    /// `capacity` bytes, valid for as long as the returned channel lives.
    unsafe fn open(base: *mut u8, capacity: usize, name: &str, index: usize) -> Result<Self> {
        let prefix = format!("{}{}", name, index);

        // Each `?` drops the signals created so far, so a failure leaves no
        // named objects behind.
        let lock = NamedSignal::create_or_open(&format!("{prefix}{LOCK_SUFFIX}"), true)?;
        let data_ready = NamedSignal::create_or_open(&format!("{prefix}{DATA_SUFFIX}"), false)?;
        let space_ready = NamedSignal::create_or_open(&format!("{prefix}{SPACE_SUFFIX}"), true)?;

        Ok(Self {
            header: base as *const ChannelHeader,
            data: base.add(CACHE_LINE_SIZE),
            capacity,
            lock,
            data_ready,
            space_ready,
        })
    }

    #[inline(always)]
    fn header(&self) -> &ChannelHeader {
        // SAFETY: see `open`.
        unsafe { &*self.header }
    }

    /// Copy out up to `buf.len()` unread bytes. Caller holds `lock`.
    fn take(&self, buf: &mut [u8]) -> usize {
        let header = self.header();
        let start = header.start.load(Ordering::Relaxed) as usize;
        let count = header.count.load(Ordering::Relaxed) as usize;

        let n = buf.len().min(count);
        let (first, second) = split_run(self.capacity, start, n);
        let split = first.len();

        // SAFETY: both ranges lie inside the data area and `buf` holds `n` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(first.start), buf.as_mut_ptr(), split);
            std::ptr::copy_nonoverlapping(
                self.data.add(second.start),
                buf.as_mut_ptr().add(split),
                second.len(),
            );
        }

        let remaining = count - n;
        header
            .start
            .store(((start + n) % self.capacity) as u64, Ordering::Relaxed);
        header.count.store(remaining as u64, Ordering::Relaxed);
        self.publish(remaining);
        n
    }

    /// Copy in as much of `src` as fits. Caller holds `lock`.
    fn put(&self, src: &[u8]) -> usize {
        let header = self.header();
        let start = header.start.load(Ordering::Relaxed) as usize;
        let count = header.count.load(Ordering::Relaxed) as usize;

        let end = (start + count) % self.capacity;
        let n = src.len().min(self.capacity - count);
        let (first, second) = split_run(self.capacity, end, n);
        let split = first.len();

        // SAFETY: both ranges lie inside the data area and are unread-free.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(first.start), split);
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(split),
                self.data.add(second.start),
                second.len(),
            );
        }

        let total = count + n;
        header.count.store(total as u64, Ordering::Relaxed);
        self.publish(total);
        n
    }

    /// Make the data/space signals mirror `count`. Caller holds `lock`.
    #[inline]
    fn publish(&self, count: usize) {
        if count > 0 {
            self.data_ready.set();
        } else {
            self.data_ready.reset();
        }
        if count < self.capacity {
            self.space_ready.set();
        } else {
            self.space_ready.reset();
        }
    }

    fn wake_all(&self) {
        self.data_ready.nudge();
        self.space_ready.nudge();
    }
}

struct Parts {
    read: RingChannel,
    write: RingChannel,
    region: SharedRegion,
    role: Role,
}

#[inline(always)]
fn stream_header(region: &SharedRegion) -> &StreamHeader {
    // SAFETY: every ring region payload starts with a stream header.
    unsafe { &*(region.as_ptr() as *const StreamHeader) }
}

impl Parts {
    #[inline(always)]
    fn header(&self) -> &StreamHeader {
        stream_header(&self.region)
    }

    #[inline]
    fn peer_departed(&self) -> bool {
        self.header().departed.load(Ordering::Acquire) & self.role.peer().bit() != 0
    }
}

impl Drop for Parts {
    fn drop(&mut self) {
        self.header()
            .departed
            .fetch_or(self.role.bit(), Ordering::AcqRel);
        // A peer blocked on us must notice the departure promptly
        self.read.wake_all();
        self.write.wake_all();
    }
}

/// A sequential byte stream over a shared-memory region
///
/// Seeking, length and position queries are not supported.
pub struct ShmStream {
    parts: Option<Parts>,
    abort: AtomicBool,
}

// SAFETY: the raw channel pointers refer into `region`, which the stream owns;
// all shared state is accessed through atomics or under the channel lock.
unsafe impl Send for ShmStream {}
unsafe impl Sync for ShmStream {}

impl ShmStream {
    /// Open `name` in `role`, creating the region if the peer has not yet.
    ///
    /// Capacities are from this side's point of view; the peer must pass the
    /// mirror image (its read capacity is our write capacity).
    pub fn open(name: &str, role: Role, read_capacity: u64, write_capacity: u64) -> Result<Self> {
        for capacity in [read_capacity, write_capacity] {
            if capacity == 0 || capacity > isize::MAX as u64 / 2 {
                return Err(IpcError::InvalidCapacity(capacity));
            }
        }

        let (read_index, write_index) = role.channels();
        let mut capacities = [0usize; 2];
        capacities[read_index] = read_capacity as usize;
        capacities[write_index] = write_capacity as usize;
        let (offsets, total) = layout(capacities[0], capacities[1]);

        let region = Self::open_fresh_region(name, role, &offsets, &capacities, total)?;

        let channels = (|| -> Result<(RingChannel, RingChannel)> {
            // Validate the creator agreed on which side gets which capacity
            for (offset, capacity) in offsets.iter().zip(capacities) {
                // SAFETY: offsets come from `layout`, which sized the region.
                let header = unsafe { &*(region.as_ptr().add(*offset) as *const ChannelHeader) };
                let recorded = header.capacity.load(Ordering::Relaxed);
                if recorded != capacity as u64 {
                    return Err(IpcError::IncompatibleRegion {
                        name: name.to_string(),
                        expected: capacity as u64,
                        got: recorded,
                    });
                }
            }

            let base = region.as_ptr();
            // SAFETY: offsets/capacities match the layout the region was built with.
            unsafe {
                let read = RingChannel::open(
                    base.add(offsets[read_index]),
                    capacities[read_index],
                    name,
                    read_index,
                )?;
                let write = RingChannel::open(
                    base.add(offsets[write_index]),
                    capacities[write_index],
                    name,
                    write_index,
                )?;
                Ok((read, write))
            }
        })();

        let (read, write) = match channels {
            Ok(channels) => channels,
            Err(e) => {
                // We attached; leave the peer able to notice we are gone
                stream_header(&region).departed.fetch_or(role.bit(), Ordering::AcqRel);
                return Err(e);
            }
        };

        debug!(name, ?role, creator = region.is_creator(), "opened ring stream");

        Ok(Self {
            parts: Some(Parts {
                read,
                write,
                region,
                role,
            }),
            abort: AtomicBool::new(false),
        })
    }

    /// Attach to the region, waiting out a previous connection that still
    /// holds the same name with our role already taken.
    fn open_fresh_region(
        name: &str,
        role: Role,
        offsets: &[usize; 2],
        capacities: &[usize; 2],
        total: usize,
    ) -> Result<SharedRegion> {
        let deadline = std::time::Instant::now() + STALE_REGION_WAIT;
        loop {
            let region = SharedRegion::create_or_open(name, total, |base| {
                for (offset, capacity) in offsets.iter().zip(capacities) {
                    // SAFETY: the creator owns the zeroed payload exclusively.
                    unsafe {
                        let header = &*(base.add(*offset) as *const ChannelHeader);
                        header.capacity.store(*capacity as u64, Ordering::Relaxed);
                    }
                }
            })?;

            let previous = stream_header(&region)
                .attached.fetch_or(role.bit(), Ordering::AcqRel);
            if previous & role.bit() == 0 {
                return Ok(region);
            }

            // Our role is taken by a connection that has not finished yet
            drop(region);
            if std::time::Instant::now() >= deadline {
                return Err(IpcError::ShmOpen {
                    name: name.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        "previous connection still holds the region",
                    ),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[inline]
    fn parts(&self) -> Result<&Parts> {
        self.parts.as_ref().ok_or(IpcError::Closed)
    }

    /// Block until `signal` fires, the peer departs, or the stream is aborted.
    /// Returning `Ok` only means "worth taking the lock and looking".
    fn wait_on(&self, parts: &Parts, signal: &NamedSignal) -> Result<()> {
        loop {
            if self.abort.load(Ordering::Acquire) {
                return Err(IpcError::Cancelled);
            }
            if parts.peer_departed() || signal.wait_timeout(POLL_SLICE) {
                return Ok(());
            }
        }
    }

    /// Read up to `buf.len()` bytes, blocking until at least one is available.
    ///
    /// Returns fewer bytes than requested whenever fewer are buffered; callers
    /// that need an exact count must loop. Returns `Ok(0)` only for an empty
    /// `buf`, and `PeerGone` once the peer left and nothing remains.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let parts = self.parts()?;
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            self.wait_on(parts, &parts.read.data_ready)?;

            let _guard = parts.read.lock.lock();
            let n = parts.read.take(buf);
            if n > 0 {
                return Ok(n);
            }
            if parts.peer_departed() {
                return Err(IpcError::PeerGone);
            }
        }
    }

    /// Write all of `buf`, blocking for space as needed.
    ///
    /// Each round writes whatever fits and releases the lock before waiting
    /// again, so the reader can always make progress.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        let parts = self.parts()?;

        while !buf.is_empty() {
            if parts.peer_departed() {
                return Err(IpcError::PeerGone);
            }
            self.wait_on(parts, &parts.write.space_ready)?;

            let _guard = parts.write.lock.lock();
            let n = parts.write.put(buf);
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Unblock any pending read/write on this handle with `Cancelled`.
    ///
    /// The stream stays open but every later wait fails immediately.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        if let Some(parts) = &self.parts {
            parts.read.wake_all();
            parts.write.wake_all();
        }
    }

    /// Release the region and all signals. Repeated calls are no-ops.
    pub fn close(&mut self) {
        if let Some(parts) = self.parts.take() {
            debug!(name = %parts.region.name(), role = ?parts.role, "closing ring stream");
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.parts.is_none()
    }
}

impl std::fmt::Debug for ShmStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("ShmStream");
        if let Some(parts) = &self.parts {
            out.field("name", &parts.region.name()).field("role", &parts.role);
        }
        out.field("closed", &self.is_closed())
            .field("aborted", &self.abort.load(Ordering::Relaxed))
            .finish()
    }
}

impl io::Read for &ShmStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ShmStream::read(*self, buf).map_err(IpcError::into_io)
    }
}

impl io::Write for &ShmStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ShmStream::write_all(*self, buf).map_err(IpcError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        (*self).parts().map(|_| ()).map_err(IpcError::into_io)
    }
}

impl io::Read for ShmStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for ShmStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{receive_message, send_message};
    use crate::shm::tests::unique_name;
    use crate::shm::MAX_NAME_LEN;
    use std::sync::Arc;

    fn pair(tag: &str, capacity: u64) -> (ShmStream, ShmStream) {
        let name = unique_name(tag);
        let server = ShmStream::open(&name, Role::Server, capacity, capacity).unwrap();
        let client = ShmStream::open(&name, Role::Client, capacity, capacity).unwrap();
        (server, client)
    }

    fn read_exactly(stream: &ShmStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            filled += stream.read(&mut out[filled..]).unwrap();
        }
        out
    }

    #[test]
    fn test_split_run() {
        assert_eq!(split_run(10, 2, 5), (2..7, 0..0));
        assert_eq!(split_run(10, 7, 5), (7..10, 0..2));
        assert_eq!(split_run(10, 0, 10), (0..10, 0..0));
        assert_eq!(split_run(10, 9, 0), (9..9, 0..0));
    }

    #[test]
    fn test_fifo_across_arbitrary_read_sizes() {
        let (server, client) = pair("ring_fifo", 64);

        let writes: [&[u8]; 3] = [b"hello ", b"shared ", b"memory ring"];
        for w in writes {
            client.write_all(w).unwrap();
        }
        let expected: Vec<u8> = writes.concat();

        let mut got = Vec::new();
        for size in [1, 4, 9, 100] {
            let mut buf = vec![0u8; size];
            let n = server.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
            if got.len() == expected.len() {
                break;
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_read_returns_min_of_requested_and_available() {
        let (server, client) = pair("ring_partial", 32);
        client.write_all(b"abc").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        client.write_all(b"defgh").unwrap();
        let mut small = [0u8; 2];
        assert_eq!(server.read(&mut small).unwrap(), 2);
        assert_eq!(&small, b"de");

        assert_eq!(server.read(&mut []).unwrap(), 0);
    }

    #[test]
    fn test_wrap_around_reconstructs_bytes() {
        let capacity = 16usize;
        let (server, client) = pair("ring_wrap", capacity as u64);

        // capacity - k written, capacity - k - j read, then j + m written
        let (k, j, m) = (3usize, 5usize, 4usize);
        let first: Vec<u8> = (0..(capacity - k) as u8).collect();
        client.write_all(&first).unwrap();
        let head = read_exactly(&server, capacity - k - j);
        assert_eq!(head, first[..capacity - k - j]);

        let second: Vec<u8> = (100..(100 + j + m) as u8).collect();
        client.write_all(&second).unwrap();

        let tail = read_exactly(&server, j + j + m);
        let mut expected = first[capacity - k - j..].to_vec();
        expected.extend_from_slice(&second);
        assert_eq!(tail, expected);
    }

    #[test]
    fn test_both_directions_are_independent() {
        let (server, client) = pair("ring_duplex", 32);
        client.write_all(b"request").unwrap();
        server.write_all(b"response").unwrap();

        assert_eq!(read_exactly(&server, 7), b"request");
        assert_eq!(read_exactly(&client, 8), b"response");
    }

    #[test]
    fn test_backpressure_never_overwrites() {
        let capacity = 8u64;
        let (server, client) = pair("ring_backpressure", capacity);
        let client = Arc::new(client);

        let payload: Vec<u8> = (0..200u8).collect();
        let writer = {
            let client = Arc::clone(&client);
            let payload = payload.clone();
            thread::spawn(move || client.write_all(&payload).unwrap())
        };

        // Give the writer time to fill the ring and block
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        let got = read_exactly(&server, payload.len());
        writer.join().unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_mismatched_capacities_rejected() {
        let name = unique_name("ring_mismatch");
        let _server = ShmStream::open(&name, Role::Server, 32, 64).unwrap();
        // Halves swapped relative to the server's view
        let err = ShmStream::open(&name, Role::Client, 32, 64).err().unwrap();
        assert!(matches!(err, IpcError::IncompatibleRegion { .. }));
    }

    #[test]
    fn test_peer_departure() {
        let (server, mut client) = pair("ring_depart", 32);
        client.write_all(b"last words").unwrap();
        client.close();
        client.close();

        // Buffered bytes are still delivered, then the departure surfaces
        assert_eq!(read_exactly(&server, 10), b"last words");
        let mut buf = [0u8; 4];
        assert!(matches!(server.read(&mut buf), Err(IpcError::PeerGone)));
        assert!(matches!(server.write_all(b"x"), Err(IpcError::PeerGone)));
    }

    #[test]
    fn test_closed_stream_rejects_io() {
        let (mut server, _client) = pair("ring_closed", 32);
        server.close();
        assert!(server.is_closed());
        assert!(matches!(server.read(&mut [0u8; 1]), Err(IpcError::Closed)));
        assert!(matches!(server.write_all(b"x"), Err(IpcError::Closed)));
    }

    #[test]
    fn test_abort_unblocks_reader() {
        let (server, _client) = pair("ring_abort", 32);
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.read(&mut [0u8; 4]))
        };

        thread::sleep(Duration::from_millis(10));
        server.abort();
        assert!(reader.join().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_abort_ends_framed_receive() {
        let (server, _client) = pair("ring_abort_frame_rx", 32);
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            thread::spawn(move || receive_message(&mut &*server))
        };

        thread::sleep(Duration::from_millis(10));
        server.abort();
        assert!(reader.join().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_abort_ends_framed_send() {
        let (_server, client) = pair("ring_abort_frame_tx", 8);
        let client = Arc::new(client);

        // Larger than the ring, so the send blocks on space
        let writer = {
            let client = Arc::clone(&client);
            thread::spawn(move || send_message(&mut &*client, "more than eight bytes"))
        };

        thread::sleep(Duration::from_millis(10));
        client.abort();
        assert!(writer.join().unwrap().unwrap_err().is_cancelled());

        // Aborted streams fail at once, even with room in the ring
        let (_server, client) = pair("ring_abort_frame_tx_idle", 64);
        client.abort();
        assert!(send_message(&mut &client, "x").unwrap_err().is_cancelled());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_open_releases_named_objects() {
        // The region name fits, but the per-channel signal names do not
        let mut name = unique_name("ring_leak");
        name.extend(std::iter::repeat('x').take(MAX_NAME_LEN - 1 - name.len()));

        let err = ShmStream::open(&name, Role::Server, 32, 32).err().unwrap();
        assert!(matches!(err, IpcError::NameTooLong { .. }));

        let leftovers: Vec<_> = std::fs::read_dir("/dev/shm")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&format!("cmdr_{name}")))
            .collect();
        assert!(leftovers.is_empty(), "leaked {leftovers:?}");
    }

    #[test]
    fn test_invalid_capacity() {
        let err = ShmStream::open(&unique_name("ring_zero"), Role::Server, 0, 16).err().unwrap();
        assert!(matches!(err, IpcError::InvalidCapacity(0)));
    }
}
