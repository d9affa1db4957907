//! Length-prefixed framing shared by the control and data channels.
//!
//! Every message is a little-endian `u32` byte count followed by that many bytes.

use crate::error::{AppResult, DaqError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(DaqError::Protocol(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` when the peer closed the connection between frames.
pub async fn read_frame<R>(reader: &mut R) -> AppResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DaqError::Protocol(format!(
                "connection closed inside a frame header ({filled} of 4 bytes)"
            )));
        }
        filled += n;
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DaqError::Protocol(format!(
            "peer announced a frame of {len} bytes, limit is {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        DaqError::Protocol(format!("connection lost inside a {len} byte frame: {e}"))
    })?;
    Ok(Some(payload))
}
