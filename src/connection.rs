//! One accepted or connected endpoint of either transport
//!
//! A [`Connection`] serves exactly one request/response exchange and is then
//! closed. Message transfer comes in a blocking form and a cancellable async
//! form; cancelling an async transfer abandons the connection, since a frame
//! may have been cut in half.

use crate::bridge::run_blocking;
use crate::cancel::CancellationToken;
use crate::error::{IpcError, Result};
use crate::framing;
use crate::ring::ShmStream;
use crate::transport::TransportKind;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tracing::debug;

enum Endpoint {
    Shm(Arc<ShmStream>),
    Socket(UnixStream),
}

/// Restores blocking mode on a socket whose descriptor was lent to tokio
struct BlockingRestore<'a>(&'a UnixStream);

impl Drop for BlockingRestore<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.set_nonblocking(false) {
            debug!(error = %e, "failed to restore blocking mode");
        }
    }
}

/// Lend `stream` to tokio for the duration of `f`
async fn with_async_socket<T, F, Fut>(stream: &UnixStream, f: F) -> Result<T>
where
    F: FnOnce(tokio::net::UnixStream) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    // The clone shares the open file description, so this flips both
    let clone = stream.try_clone()?;
    clone.set_nonblocking(true)?;
    let _restore = BlockingRestore(stream);
    let async_stream = tokio::net::UnixStream::from_std(clone)?;
    f(async_stream).await
}

/// A duplex, message-oriented endpoint
pub struct Connection {
    endpoint: Option<Endpoint>,
    kind: TransportKind,
}

impl Connection {
    pub(crate) fn from_shm(stream: ShmStream) -> Self {
        Self {
            endpoint: Some(Endpoint::Shm(Arc::new(stream))),
            kind: TransportKind::SharedMemory,
        }
    }

    pub(crate) fn from_socket(stream: UnixStream) -> Self {
        Self {
            endpoint: Some(Endpoint::Socket(stream)),
            kind: TransportKind::LocalSocket,
        }
    }

    /// Which transport carries this connection
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_none()
    }

    fn endpoint(&mut self) -> Result<&mut Endpoint> {
        self.endpoint.as_mut().ok_or(IpcError::Closed)
    }

    /// Send one framed message, blocking until it is fully written.
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        match self.endpoint()? {
            Endpoint::Shm(stream) => framing::send_message(&mut &**stream, text),
            Endpoint::Socket(stream) => framing::send_message(stream, text),
        }
    }

    /// Receive one framed message, blocking until it has fully arrived.
    pub fn receive_message(&mut self) -> Result<String> {
        match self.endpoint()? {
            Endpoint::Shm(stream) => framing::receive_message(&mut &**stream),
            Endpoint::Socket(stream) => framing::receive_message(stream),
        }
    }

    /// Cancellable [`send_message`](Self::send_message).
    pub async fn send_message_async(&mut self, text: &str, token: &CancellationToken) -> Result<()> {
        let result = match self.endpoint()? {
            Endpoint::Shm(stream) => {
                let (writer, aborter) = (Arc::clone(stream), Arc::clone(stream));
                let text = text.to_string();
                run_blocking(token, move || aborter.abort(), move |_| {
                    framing::send_message(&mut &*writer, &text)
                })
                .await
            }
            Endpoint::Socket(stream) => {
                with_async_socket(stream, |mut s| async move {
                    framing::send_message_async(&mut s, text, token).await
                })
                .await
            }
        };
        self.abandon_if_cancelled(result)
    }

    /// Cancellable [`receive_message`](Self::receive_message).
    pub async fn receive_message_async(&mut self, token: &CancellationToken) -> Result<String> {
        let result = match self.endpoint()? {
            Endpoint::Shm(stream) => {
                let (reader, aborter) = (Arc::clone(stream), Arc::clone(stream));
                run_blocking(token, move || aborter.abort(), move |_| {
                    framing::receive_message(&mut &*reader)
                })
                .await
            }
            Endpoint::Socket(stream) => {
                with_async_socket(stream, |mut s| async move {
                    framing::receive_message_async(&mut s, token).await
                })
                .await
            }
        };
        self.abandon_if_cancelled(result)
    }

    fn abandon_if_cancelled<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.as_ref().is_err_and(|e| e.is_cancelled()) {
            debug!(kind = %self.kind, "transfer cancelled, abandoning connection");
            self.close();
        }
        result
    }

    /// Release the endpoint. Repeated calls are no-ops.
    pub fn close(&mut self) {
        match self.endpoint.take() {
            Some(Endpoint::Shm(stream)) => drop(stream),
            Some(Endpoint::Socket(stream)) => {
                // The peer may already be gone; nothing to report then
                let _ = stream.shutdown(Shutdown::Both);
            }
            None => {}
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
