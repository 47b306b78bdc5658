//! One-shot command invocation from the caller's side

use crate::cancel::CancellationToken;
use crate::command::{Request, Response};
use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::transport;
use tracing::debug;

fn classify(reply: String) -> Result<Response> {
    Response::decode(&reply).ok_or(IpcError::UnrecognizedResponse(reply))
}

/// Connect, send `request`, wait for the reply and close.
///
/// A reply that is neither `OK` nor `FAIL` is `Err(UnrecognizedResponse)`,
/// never a success.
pub fn invoke(config: &IpcConfig, request: &Request) -> Result<Response> {
    let mut conn = transport::connect(config)?;
    debug!(channel = %config.channel, %request, "sending request");

    conn.send_message(&request.encode())?;
    let reply = conn.receive_message()?;
    conn.close();
    classify(reply)
}

/// Cancellable [`invoke`]. Every stage, from connecting to the reply, stops
/// with `Err(Cancelled)` once `token` fires.
pub async fn invoke_async(
    config: &IpcConfig,
    request: &Request,
    token: &CancellationToken,
) -> Result<Response> {
    let mut conn = transport::connect_async(config, token).await?;
    debug!(channel = %config.channel, %request, "sending request");

    conn.send_message_async(&request.encode(), token).await?;
    let reply = conn.receive_message_async(token).await?;
    conn.close();
    classify(reply)
}
