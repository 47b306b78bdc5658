//! Commander IPC - invoke named operations inside a long-running process
//!
//! A caller sends a NUL-joined command (`target\0operation\0args...`) to a
//! server process and gets back `OK`, `OK\0result`, `FAIL` or `FAIL\0error`.
//!
//! # Architecture
//!
//! - **Transports**: a shared-memory ring stream (two ring buffers in one
//!   named region, guarded by process-shared futex signals) and a local
//!   socket. [`transport`] picks one per platform capability.
//! - **Framing**: every message is a 4-byte length plus UTF-8 text.
//! - **Cancellation**: async accept/connect and message transfer take a
//!   [`CancellationToken`]; [`bridge`] carries it into blocking OS calls.
//! - **Server**: [`CommandServer`] runs the accept loop as a tokio task and
//!   hands each request to a [`Dispatch`] implementation.

pub mod bridge;
pub mod cancel;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
mod futex;
pub mod ring;
pub mod server;
pub mod shm;
pub mod shm_listener;
pub mod signal;
pub mod socket;
pub mod transport;

pub use cancel::CancellationToken;
pub use client::{invoke, invoke_async};
pub use command::{Request, Response};
pub use config::IpcConfig;
pub use connection::Connection;
pub use error::{IpcError, Result};
pub use ring::{Role, ShmStream, DEFAULT_CAPACITY};
pub use server::{CommandServer, Dispatch, DispatchError, DispatchResult, Registry};
pub use transport::{connect, connect_async, Listener, TransportKind};
