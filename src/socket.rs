//! Local-socket transport
//!
//! The listener binds a filesystem-addressed stream socket with a backlog of
//! one. Blocking calls run on a non-blocking descriptor polled in short slices,
//! so an abort flag raised from another thread ends them promptly; the async
//! variants hand that flag to a [`crate::bridge::CancelBridge`] as their
//! force-abort action.

use crate::bridge::run_blocking;
use crate::cancel::CancellationToken;
use crate::error::{IpcError, Result};
use crate::signal::POLL_SLICE;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{AddressFamily, SocketAddrUnix, SocketType};
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pending connections the kernel queues for us
const BACKLOG: i32 = 1;

fn new_socket() -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = rustix::net::socket_with(
        AddressFamily::UNIX,
        SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = rustix::net::socket(AddressFamily::UNIX, SocketType::STREAM, None)?;
    Ok(fd)
}

/// Sleep until `fd` is ready for `flags`, at most one poll slice
fn wait_ready<Fd: AsFd>(fd: &Fd, flags: PollFlags) -> io::Result<()> {
    let mut fds = [PollFd::new(fd, flags)];
    match poll(&mut fds, POLL_SLICE.as_millis() as i32) {
        Ok(_) | Err(Errno::INTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn socket_error(path: &Path, source: io::Error) -> IpcError {
    IpcError::Socket {
        path: path.to_path_buf(),
        source,
    }
}

/// Best-effort removal of a socket file; a missing file is the common case
fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "could not remove socket file"),
    }
}

struct ListenerInner {
    listener: UnixListener,
    path: PathBuf,
}

impl ListenerInner {
    fn accept_until(&self, abort: &AtomicBool) -> Result<UnixStream> {
        loop {
            if abort.load(Ordering::Acquire) {
                return Err(IpcError::Cancelled);
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Some platforms let the accepted socket inherit O_NONBLOCK
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_ready(&self.listener, PollFlags::IN)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Listening end of the local-socket transport
pub struct SocketListener {
    inner: Arc<ListenerInner>,
    closed: bool,
}

impl SocketListener {
    /// Bind `path`, replacing any stale socket file left there.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_socket_file(&path);

        let err = |source: io::Error| socket_error(&path, source);
        let addr = SocketAddrUnix::new(path.as_path()).map_err(|e| err(e.into()))?;
        let fd = new_socket().map_err(&err)?;
        rustix::net::bind_unix(&fd, &addr).map_err(|e| err(e.into()))?;
        rustix::net::listen(&fd, BACKLOG).map_err(|e| err(e.into()))?;

        let listener = UnixListener::from(fd);
        listener.set_nonblocking(true).map_err(&err)?;

        debug!(path = %path.display(), "socket listener bound");
        Ok(Self {
            inner: Arc::new(ListenerInner { listener, path }),
            closed: false,
        })
    }

    /// Path the listener is bound to
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Block until a client connects.
    pub fn accept(&self) -> Result<UnixStream> {
        if self.closed {
            return Err(IpcError::Closed);
        }
        self.inner.accept_until(&AtomicBool::new(false))
    }

    /// Wait for a client without blocking the runtime; `Err(Cancelled)` if
    /// `token` fires first, in which case no connection is returned.
    pub async fn accept_async(&self, token: &CancellationToken) -> Result<UnixStream> {
        if self.closed {
            return Err(IpcError::Closed);
        }
        let inner = Arc::clone(&self.inner);
        run_blocking(token, || {}, move |abort| inner.accept_until(abort)).await
    }

    /// Stop listening for new clients and remove the socket file.
    ///
    /// The descriptor itself closes once no accept is still running on it.
    /// Repeated calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        remove_socket_file(&self.inner.path);
        debug!(path = %self.inner.path.display(), "socket listener closed");
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_until(path: &Path, abort: &AtomicBool) -> Result<UnixStream> {
    let err = |source: io::Error| socket_error(path, source);
    let addr = SocketAddrUnix::new(path).map_err(|e| err(e.into()))?;
    let fd = new_socket().map_err(&err)?;
    rustix::io::ioctl_fionbio(&fd, true).map_err(|e| err(e.into()))?;

    loop {
        if abort.load(Ordering::Acquire) {
            return Err(IpcError::Cancelled);
        }
        match rustix::net::connect_unix(&fd, &addr) {
            Ok(()) | Err(Errno::ISCONN) => break,
            // Backlog full or handshake still running
            Err(Errno::AGAIN) | Err(Errno::INPROGRESS) | Err(Errno::ALREADY) => {
                wait_ready(&fd, PollFlags::OUT).map_err(&err)?;
            }
            Err(Errno::INTR) => {}
            Err(e) => return Err(err(e.into())),
        }
    }

    let stream = UnixStream::from(fd);
    stream.set_nonblocking(false).map_err(&err)?;
    Ok(stream)
}

/// Connect to a listener bound at `path`.
pub fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|e| socket_error(path, e))?;
    debug!(path = %path.display(), "socket connected");
    Ok(stream)
}

/// Cancellable [`connect`]; a connection that completes after `token` fired is
/// closed, never returned.
pub async fn connect_async(path: impl AsRef<Path>, token: &CancellationToken) -> Result<UnixStream> {
    let path = path.as_ref().to_path_buf();
    let stream = run_blocking(token, || {}, {
        let path = path.clone();
        move |abort| connect_until(&path, abort)
    })
    .await;

    match &stream {
        Ok(_) => debug!(path = %path.display(), "socket connected"),
        Err(e) if e.is_cancelled() => debug!(path = %path.display(), "socket connect cancelled"),
        Err(e) => warn!(path = %path.display(), error = %e, "socket connect failed"),
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{receive_message, send_message};
    use std::thread;
    use std::time::Duration;

    fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("commander.sock")
    }

    #[test]
    fn test_accept_and_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = SocketListener::bind(&path).unwrap();

        let client = {
            let path = path.clone();
            thread::spawn(move || {
                let mut stream = connect(&path).unwrap();
                send_message(&mut stream, "ping").unwrap();
                receive_message(&mut stream).unwrap()
            })
        };

        let mut stream = listener.accept().unwrap();
        assert_eq!(receive_message(&mut stream).unwrap(), "ping");
        send_message(&mut stream, "pong").unwrap();
        assert_eq!(client.join().unwrap(), "pong");
    }

    #[test]
    fn test_stale_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        fs::write(&path, b"stale").unwrap();

        let listener = SocketListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path);
    }

    #[test]
    fn test_close_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);

        let mut listener = SocketListener::bind(&path).unwrap();
        assert!(path.exists());
        listener.close();
        listener.close();
        assert!(!path.exists());
        assert!(matches!(listener.accept(), Err(IpcError::Closed)));
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect(socket_path(&dir)).unwrap_err();
        assert!(matches!(err, IpcError::Socket { .. }));
    }

    #[tokio::test]
    async fn test_async_accept_and_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = SocketListener::bind(&path).unwrap();
        let token = CancellationToken::new();

        let (accepted, connected) =
            tokio::join!(listener.accept_async(&token), connect_async(&path, &token));
        let mut accepted = accepted.unwrap();
        let mut connected = connected.unwrap();

        send_message(&mut connected, "hello").unwrap();
        assert_eq!(receive_message(&mut accepted).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_async_accept_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let listener = SocketListener::bind(socket_path(&dir)).unwrap();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let err = listener.accept_async(&token).await.unwrap_err();
        assert!(err.is_cancelled());
        canceller.await.unwrap();

        // The listener survives a cancelled accept
        let path = listener.path().to_path_buf();
        let client = thread::spawn(move || connect(path).unwrap());
        listener.accept().unwrap();
        client.join().unwrap();
    }

    #[tokio::test]
    async fn test_precancelled_connect() {
        let dir = tempfile::tempdir().unwrap();
        let _listener = SocketListener::bind(socket_path(&dir)).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = connect_async(socket_path(&dir), &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
