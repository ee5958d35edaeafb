//! Length-prefixed framing: a 4-byte big-endian length, then that many bytes.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

pub async fn write_frame<W>(w: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = checked_len(payload.len(), max_frame_bytes)?;
    w.write_u32(len).await.map_err(TransportError::ConnectionLost)?;
    w.write_all(payload).await.map_err(TransportError::ConnectionLost)?;
    w.flush().await.map_err(TransportError::ConnectionLost)
}

/// Reads one whole frame, reassembling it across short reads.
pub async fn read_frame<R>(r: &mut R, max_frame_bytes: usize) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32().await.map_err(TransportError::ConnectionLost)? as usize;
    if len > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await.map_err(TransportError::ConnectionLost)?;
    Ok(buf.freeze())
}

fn checked_len(len: usize, max_frame_bytes: usize) -> Result<u32, TransportError> {
    if len > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

/// Reading a frame off a closed stream yields `UnexpectedEof`.
pub fn is_clean_eof(err: &TransportError) -> bool {
    matches!(err, TransportError::ConnectionLost(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}
