//! Connection configuration

use crate::ring::DEFAULT_CAPACITY;
use crate::transport::TransportKind;
use std::path::PathBuf;

/// Configuration shared by listeners and connectors
///
/// The channel identifier names the shared-memory objects and, for the
/// local-socket transport, is the socket's filesystem path. Both ends must
/// use the same identifier and transport; ring capacities are from this
/// side's point of view, so the peer's read capacity is our write capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcConfig {
    /// Channel identifier
    pub channel: String,
    /// Forced transport; `None` lets [`TransportKind::detect`] decide
    pub transport: Option<TransportKind>,
    /// Capacity of the ring we read from
    pub read_capacity: u64,
    /// Capacity of the ring we write to
    pub write_capacity: u64,
}

impl IpcConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            transport: None,
            read_capacity: DEFAULT_CAPACITY,
            write_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    /// Set both ring capacities
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.read_capacity = capacity;
        self.write_capacity = capacity;
        self
    }

    /// The transport this configuration resolves to
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.unwrap_or_else(TransportKind::detect)
    }

    /// Socket path for the local-socket transport
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.channel)
    }
}
