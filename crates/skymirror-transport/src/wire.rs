//! Wire format for protocol frames.
//!
//! Frames use postcard serialization with length-prefixed framing (4-byte big-endian).

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::DecodeSnafu;
use crate::error::EncodeSnafu;
use crate::error::FrameIoSnafu;
use crate::error::FrameTooLargeSnafu;
use crate::error::TransportError;

/// Read a length-prefixed frame.
///
/// Format: `[u32 big-endian length][postcard-encoded body]`
pub async fn read_frame<T, R>(recv: &mut R, max_size: usize) -> Result<T, TransportError>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await.context(FrameIoSnafu)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return FrameTooLargeSnafu { size: len, max: max_size }.fail();
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await.context(FrameIoSnafu)?;

    postcard::from_bytes(&buf).context(DecodeSnafu)
}

/// Write a length-prefixed frame.
///
/// Format: `[u32 big-endian length][postcard-encoded body]`
pub async fn write_frame<T, W>(send: &mut W, frame: &T, max_size: usize) -> Result<(), TransportError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let buf = postcard::to_allocvec(frame).context(EncodeSnafu)?;

    if buf.len() > max_size {
        return FrameTooLargeSnafu {
            size: buf.len(),
            max: max_size,
        }
        .fail();
    }

    let len = buf.len() as u32;
    send.write_all(&len.to_be_bytes()).await.context(FrameIoSnafu)?;
    send.write_all(&buf).await.context(FrameIoSnafu)?;
    send.flush().await.context(FrameIoSnafu)?;

    Ok(())
}
