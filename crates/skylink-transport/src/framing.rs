//! Length-delimited framing for the stream transports.
//!
//! Wire format: 4-byte big-endian length, then the payload. The tunnel and
//! RPC variants both frame JSON this way; the datagram variant relies on
//! datagram boundaries instead.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame (1 MiB). Relay envelopes are small; anything
/// bigger is a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {MAX_FRAME_SIZE})", payload.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame.
///
/// Returns `UnexpectedEof` if the peer closes mid-frame and `InvalidData` for
/// an oversized length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
