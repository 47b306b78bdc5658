//! Command server
//!
//! Runs the accept loop as a tokio task: one connection at a time, one
//! request/response exchange per connection. Dispatch failures and panics
//! become `FAIL` responses; cancellation stops the loop cleanly, and any other
//! accept failure stops it too.

use crate::cancel::CancellationToken;
use crate::command::{Request, Response};
use crate::config::IpcConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::transport::{Listener, TransportKind};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a command could not produce a result
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("Unknown operation '{operation}' on '{target}'")]
    UnknownOperation { target: String, operation: String },

    #[error("Expected {expected} argument(s), got {got}")]
    ArgumentCount { expected: usize, got: usize },

    /// The operation itself failed; the text is sent to the caller verbatim
    #[error("{0}")]
    Failed(String),

    #[error("Operation panicked: {0}")]
    Panicked(String),
}

/// Outcome of dispatching one command
pub type DispatchResult = std::result::Result<Option<String>, DispatchError>;

/// Maps a decoded request to an operation and runs it.
///
/// `Ok(None)` means the operation succeeded without a result.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, request: &Request) -> DispatchResult;
}

impl<F> Dispatch for F
where
    F: Fn(&Request) -> DispatchResult + Send + Sync + 'static,
{
    fn dispatch(&self, request: &Request) -> DispatchResult {
        self(request)
    }
}

type Handler = Box<dyn Fn(&[String]) -> DispatchResult + Send + Sync>;

/// A [`Dispatch`] table keyed by target and operation name
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, HashMap<String, Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `target.operation`, replacing any previous one.
    pub fn register<F>(&mut self, target: &str, operation: &str, handler: F) -> &mut Self
    where
        F: Fn(&[String]) -> DispatchResult + Send + Sync + 'static,
    {
        self.handlers
            .entry(target.to_string())
            .or_default()
            .insert(operation.to_string(), Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatch for Registry {
    fn dispatch(&self, request: &Request) -> DispatchResult {
        let operations = self
            .handlers
            .get(&request.target)
            .ok_or_else(|| DispatchError::UnknownTarget(request.target.clone()))?;
        let handler =
            operations
                .get(&request.operation)
                .ok_or_else(|| DispatchError::UnknownOperation {
                    target: request.target.clone(),
                    operation: request.operation.clone(),
                })?;
        handler(&request.args)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decode `text`, dispatch it and build the reply. Never fails: every problem
/// becomes a `FAIL` response.
pub fn handle_request(dispatcher: &dyn Dispatch, text: &str) -> Response {
    let request = match Request::decode(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "rejecting malformed request");
            return Response::Fail(Some(e.to_string()));
        }
    };
    debug!(%request, "dispatching");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&request)))
        .unwrap_or_else(|payload| Err(DispatchError::Panicked(panic_message(payload.as_ref()))));

    match outcome {
        Ok(result) => Response::Ok(result),
        Err(e) => {
            warn!(%request, error = %e, "command failed");
            Response::Fail(Some(e.to_string()))
        }
    }
}

/// Receive one request, answer it, close the connection.
async fn serve_connection(
    mut conn: Connection,
    dispatcher: &Arc<dyn Dispatch>,
    token: &CancellationToken,
) -> Result<()> {
    let text = conn.receive_message_async(token).await?;

    let dispatcher = Arc::clone(dispatcher);
    let response = tokio::task::spawn_blocking(move || handle_request(dispatcher.as_ref(), &text))
        .await?;

    conn.send_message_async(&response.encode(), token).await?;
    conn.close();
    Ok(())
}

async fn accept_loop(listener: Listener, dispatcher: Arc<dyn Dispatch>, token: CancellationToken) {
    info!(kind = %listener.kind(), "command server accepting connections");

    loop {
        let conn = match listener.accept_async(&token).await {
            Ok(conn) => conn,
            Err(e) if e.is_cancelled() => {
                info!("accept cancelled, stopping command server");
                break;
            }
            Err(e) => {
                error!(error = %e, "accept failed, stopping command server");
                break;
            }
        };
        debug!(kind = %conn.kind(), "connection accepted");

        match serve_connection(conn, &dispatcher, &token).await {
            Ok(()) => debug!("exchange complete"),
            Err(e) if e.is_cancelled() => {
                info!("exchange cancelled, stopping command server");
                break;
            }
            // A misbehaving client only costs its own exchange
            Err(e) => warn!(error = %e, "exchange failed"),
        }
    }

    drop(listener);
    info!("command server stopped");
}

/// A running accept loop bound to one channel
pub struct CommandServer {
    channel: String,
    kind: TransportKind,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CommandServer {
    /// Bind the configured channel and start serving on the current tokio
    /// runtime.
    pub fn start<D: Dispatch>(config: &IpcConfig, dispatcher: D) -> Result<Self> {
        let listener = Listener::bind(config)?;
        let kind = listener.kind();
        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, Arc::new(dispatcher), token.clone()));

        info!(channel = %config.channel, %kind, "command server started");
        Ok(Self {
            channel: config.channel.clone(),
            kind,
            token,
            task: Some(task),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the accept loop and wait for it to release the listener.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(channel = %self.channel, "shutting down command server");
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        // Without an explicit shutdown the loop still stops, just unjoined
        self.token.cancel();
    }
}

impl std::fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .field("running", &self.is_running())
            .finish()
    }
}
