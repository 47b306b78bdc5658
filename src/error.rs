//! Error types for Commander IPC

use std::io;
use std::path::PathBuf;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Result type for Commander IPC operations
pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors that can occur in Commander IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// An existing region was created with a different layout
    #[error("Shared memory '{name}' has incompatible size: expected {expected} bytes, got {got} bytes")]
    IncompatibleRegion { name: String, expected: u64, got: u64 },

    /// Name too long for the OS object namespace
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Name is empty or contains a NUL byte
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// Ring capacity must be positive
    #[error("Invalid ring capacity: {0}")]
    InvalidCapacity(u64),

    /// Failed to bind or connect a local socket
    #[error("Local socket '{}' failed: {source}", path.display())]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Plain I/O failure on an established stream
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// The operation was cancelled through its cancellation signal
    #[error("Operation was cancelled")]
    Cancelled,

    /// The stream or listener was already closed
    #[error("Stream has been closed")]
    Closed,

    /// The other end released its side of the stream
    #[error("Peer has closed the stream")]
    PeerGone,

    /// Length prefix beyond what a frame may carry
    #[error("Frame too large: max {max} bytes, got {got} bytes")]
    FrameTooLarge { max: u64, got: u64 },

    /// Payload was not valid UTF-8
    #[error("Message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// Request did not carry a target and an operation
    #[error("Malformed request: {0:?}")]
    MalformedRequest(String),

    /// Response status was neither OK nor FAIL
    #[error("Unrecognized response: {0:?}")]
    UnrecognizedResponse(String),

    /// A background task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl IpcError {
    /// Returns true if this error means "cancelled" rather than "failed"
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IpcError::Cancelled)
    }

    /// Wrap into an `io::Error` so it can travel through `std::io` traits
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            IpcError::Io(e) => e,
            other => {
                let kind = match other {
                    IpcError::PeerGone => io::ErrorKind::BrokenPipe,
                    IpcError::Closed => io::ErrorKind::NotConnected,
                    // Not `Interrupted`: std's read_exact/write_all retry on it
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(e: io::Error) -> Self {
        // Unwrap errors that were tunnelled through `into_io`
        if e.get_ref().is_some_and(|inner| inner.is::<IpcError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(ipc) = inner.downcast::<IpcError>() {
                    return *ipc;
                }
            }
            return IpcError::Io(io::Error::other("unreadable tunnelled error"));
        }
        IpcError::Io(e)
    }
}

impl From<tokio::task::JoinError> for IpcError {
    fn from(e: tokio::task::JoinError) -> Self {
        IpcError::TaskFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_survives_io_tunnel() {
        let io_err = IpcError::Cancelled.into_io();
        assert_ne!(io_err.kind(), io::ErrorKind::Interrupted);
        assert!(IpcError::from(io_err).is_cancelled());
    }

    #[test]
    fn test_peer_gone_maps_to_broken_pipe() {
        let io_err = IpcError::PeerGone.into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(IpcError::from(io_err), IpcError::PeerGone));
    }

    #[test]
    fn test_plain_io_stays_io() {
        let err = IpcError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        match err {
            IpcError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }
}
