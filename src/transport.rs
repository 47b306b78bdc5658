//! Transport selection
//!
//! [`Listener`] and [`connect`] pick the shared-memory or local-socket
//! transport from an [`IpcConfig`]; everything above this module only sees
//! [`Connection`].

use crate::cancel::CancellationToken;
use crate::config::IpcConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::shm_listener::{self, ShmListener};
use crate::socket::{self, SocketListener};
use std::fmt;
use std::os::unix::net::UnixStream;
use std::str::FromStr;
use tracing::debug;

/// The two ways a connection can be carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Ring buffers in a named shared-memory region
    SharedMemory,
    /// Filesystem-addressed stream socket
    LocalSocket,
}

impl TransportKind {
    /// Pick the cheaper transport the platform supports: local sockets where
    /// they work, shared memory otherwise.
    pub fn detect() -> Self {
        match UnixStream::pair() {
            Ok(_) => TransportKind::LocalSocket,
            Err(e) => {
                debug!(error = %e, "local sockets unavailable, using shared memory");
                TransportKind::SharedMemory
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::SharedMemory => "shm",
            TransportKind::LocalSocket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shm" | "shared-memory" => Ok(TransportKind::SharedMemory),
            "socket" | "local-socket" => Ok(TransportKind::LocalSocket),
            other => Err(format!("unknown transport '{other}' (expected 'shm' or 'socket')")),
        }
    }
}

/// Server side of either transport
pub enum Listener {
    Shm(ShmListener),
    Socket(SocketListener),
}

impl Listener {
    /// Start listening on the configured channel.
    pub fn bind(config: &IpcConfig) -> Result<Self> {
        let listener = match config.transport_kind() {
            TransportKind::SharedMemory => Listener::Shm(ShmListener::bind(
                &config.channel,
                config.read_capacity,
                config.write_capacity,
            )?),
            TransportKind::LocalSocket => {
                Listener::Socket(SocketListener::bind(config.socket_path())?)
            }
        };
        debug!(channel = %config.channel, kind = %listener.kind(), "listener bound");
        Ok(listener)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Listener::Shm(_) => TransportKind::SharedMemory,
            Listener::Socket(_) => TransportKind::LocalSocket,
        }
    }

    /// Block until a client connects.
    pub fn accept(&self) -> Result<Connection> {
        match self {
            Listener::Shm(l) => l.accept().map(Connection::from_shm),
            Listener::Socket(l) => l.accept().map(Connection::from_socket),
        }
    }

    /// Wait for a client; `Err(Cancelled)` if `token` fires first.
    pub async fn accept_async(&self, token: &CancellationToken) -> Result<Connection> {
        match self {
            Listener::Shm(l) => l.accept_async(token).await.map(Connection::from_shm),
            Listener::Socket(l) => l.accept_async(token).await.map(Connection::from_socket),
        }
    }
}

/// Connect to the configured channel, blocking until the server accepts.
pub fn connect(config: &IpcConfig) -> Result<Connection> {
    match config.transport_kind() {
        TransportKind::SharedMemory => shm_listener::connect(
            &config.channel,
            config.read_capacity,
            config.write_capacity,
        )
        .map(Connection::from_shm),
        TransportKind::LocalSocket => {
            socket::connect(config.socket_path()).map(Connection::from_socket)
        }
    }
}

/// Cancellable [`connect`]
pub async fn connect_async(config: &IpcConfig, token: &CancellationToken) -> Result<Connection> {
    match config.transport_kind() {
        TransportKind::SharedMemory => shm_listener::connect_async(
            &config.channel,
            config.read_capacity,
            config.write_capacity,
            token,
        )
        .await
        .map(Connection::from_shm),
        TransportKind::LocalSocket => socket::connect_async(config.socket_path(), token)
            .await
            .map(Connection::from_socket),
    }
}
