//! Shared-memory rendezvous
//!
//! Two named signals pair a server with one client at a time: the server
//! raises "server ready" (`<name>0c`) and waits for "client ready"
//! (`<name>1c`); the client does the mirror image. Once both have passed the
//! handshake each side opens the ring stream `<name>` in its own role.

use crate::bridge::run_blocking;
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::ring::{Role, ShmStream};
use crate::signal::NamedSignal;
use std::sync::Arc;
use tracing::debug;

const SERVER_READY_SUFFIX: &str = "0c";
const CLIENT_READY_SUFFIX: &str = "1c";

/// The pair of handshake signals for one channel name
struct Handshake {
    server_ready: Arc<NamedSignal>,
    client_ready: Arc<NamedSignal>,
}

impl Handshake {
    fn open(name: &str) -> Result<Self> {
        let server_ready =
            NamedSignal::create_or_open(&format!("{name}{SERVER_READY_SUFFIX}"), false)?;
        let client_ready =
            NamedSignal::create_or_open(&format!("{name}{CLIENT_READY_SUFFIX}"), false)?;
        Ok(Self {
            server_ready: Arc::new(server_ready),
            client_ready: Arc::new(client_ready),
        })
    }

    /// (signal this role raises, signal this role waits for)
    fn for_role(&self, role: Role) -> (&Arc<NamedSignal>, &Arc<NamedSignal>) {
        match role {
            Role::Server => (&self.server_ready, &self.client_ready),
            Role::Client => (&self.client_ready, &self.server_ready),
        }
    }

    fn rendezvous(&self, name: &str, role: Role, read: u64, write: u64) -> Result<ShmStream> {
        let (mine, theirs) = self.for_role(role);
        mine.set();
        theirs.wait();
        ShmStream::open(name, role, read, write)
    }

    async fn rendezvous_async(
        &self,
        name: &str,
        role: Role,
        read: u64,
        write: u64,
        token: &CancellationToken,
    ) -> Result<ShmStream> {
        token.check()?;
        let (mine, theirs) = self.for_role(role);
        mine.set();

        let waited = Arc::clone(theirs);
        let nudged = Arc::clone(theirs);
        let name_owned = name.to_string();
        let result = run_blocking(token, move || nudged.nudge(), move |abort| {
            waited.wait_or_abort(abort)?;
            ShmStream::open(&name_owned, role, read, write)
        })
        .await;

        if result.as_ref().is_err_and(|e| e.is_cancelled()) {
            // Withdraw our half of the handshake if nobody consumed it yet
            if mine.try_take() {
                debug!(name, ?role, "withdrew ready signal after cancellation");
            }
        }
        result
    }
}

/// Listening end of the shared-memory transport
pub struct ShmListener {
    name: String,
    read_capacity: u64,
    write_capacity: u64,
    handshake: Handshake,
}

impl ShmListener {
    /// Open the handshake signals for `name`.
    ///
    /// Capacities are from the server's point of view and must mirror the
    /// client's.
    pub fn bind(name: &str, read_capacity: u64, write_capacity: u64) -> Result<Self> {
        let handshake = Handshake::open(name)?;
        debug!(name, read_capacity, write_capacity, "shared memory listener ready");
        Ok(Self {
            name: name.to_string(),
            read_capacity,
            write_capacity,
            handshake,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a client completes the handshake.
    pub fn accept(&self) -> Result<ShmStream> {
        self.handshake
            .rendezvous(&self.name, Role::Server, self.read_capacity, self.write_capacity)
    }

    /// Cancellable [`accept`](Self::accept). A cancelled accept withdraws its
    /// "server ready" signal so a later client does not pair with nobody.
    pub async fn accept_async(&self, token: &CancellationToken) -> Result<ShmStream> {
        self.handshake
            .rendezvous_async(
                &self.name,
                Role::Server,
                self.read_capacity,
                self.write_capacity,
                token,
            )
            .await
    }
}

/// Connect to the shared-memory listener `name`, blocking until it accepts.
///
/// Capacities are from the client's point of view.
pub fn connect(name: &str, read_capacity: u64, write_capacity: u64) -> Result<ShmStream> {
    let handshake = Handshake::open(name)?;
    handshake.rendezvous(name, Role::Client, read_capacity, write_capacity)
}

/// Cancellable [`connect`]
pub async fn connect_async(
    name: &str,
    read_capacity: u64,
    write_capacity: u64,
    token: &CancellationToken,
) -> Result<ShmStream> {
    let handshake = Handshake::open(name)?;
    handshake
        .rendezvous_async(name, Role::Client, read_capacity, write_capacity, token)
        .await
}
