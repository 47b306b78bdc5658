//! Length-prefixed message framing.
//!
//! Each message is a 4-byte little-endian length followed by that many bytes
//! of UTF-8 text. Lengths above `i32::MAX` are rejected on receive so both
//! ends agree on a signed 32-bit bound.

use crate::cancel::CancellationToken;
use crate::error::{IpcError, Result};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const PREFIX_LEN: usize = 4;

/// Largest payload a frame may carry
pub const MAX_FRAME_LEN: usize = i32::MAX as usize;

fn encode_frame(text: &str) -> Result<Vec<u8>> {
    let len = text.len();
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            max: MAX_FRAME_LEN as u64,
            got: len as u64,
        });
    }

    // Prefix and payload go out in one write
    let mut frame = Vec::with_capacity(PREFIX_LEN + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

fn decode_len(prefix: [u8; PREFIX_LEN]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            max: MAX_FRAME_LEN as u64,
            got: len as u64,
        });
    }
    Ok(len)
}

/// A payload read short of its announced length is a truncated frame
fn check_complete(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

/// Write one framed message
pub fn send_message<W: Write>(writer: &mut W, text: &str) -> Result<()> {
    let frame = encode_frame(text)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message, looping over short reads
pub fn receive_message<R: Read>(reader: &mut R) -> Result<String> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix)?;
    let len = decode_len(prefix)?;

    // Grows with the bytes that actually arrive, not with the announced length
    let mut payload = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    check_complete(&payload, len)?;
    Ok(String::from_utf8(payload)?)
}

/// Async [`send_message`]; `Err(Cancelled)` if `token` fires first.
///
/// A cancelled send may have written part of the frame, so the stream must be
/// abandoned afterwards.
pub async fn send_message_async<W>(
    writer: &mut W,
    text: &str,
    token: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    token.check()?;
    let frame = encode_frame(text)?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(IpcError::Cancelled),
        result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        } => result.map_err(IpcError::from),
    }
}

/// Async [`receive_message`]; `Err(Cancelled)` if `token` fires first.
pub async fn receive_message_async<R>(reader: &mut R, token: &CancellationToken) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    token.check()?;
    let payload = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(IpcError::Cancelled),
        payload = async {
            let mut prefix = [0u8; PREFIX_LEN];
            reader.read_exact(&mut prefix).await?;
            let len = decode_len(prefix)?;

            let mut payload = Vec::new();
            (&mut *reader).take(len as u64).read_to_end(&mut payload).await?;
            check_complete(&payload, len)?;
            Ok::<_, IpcError>(payload)
        } => payload?,
    };
    Ok(String::from_utf8(payload)?)
}
