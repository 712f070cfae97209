//! Byte-exact copying of a declared-length payload.

use super::manager::Transfer;
use crate::error::Error;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk size used by every payload copy.
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Why a copy stopped before the declared length.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The source ended early.
    #[error("source ended after {moved} of {expected} bytes")]
    ShortRead {
        /// Bytes moved before the end.
        moved: u64,
        /// Declared length.
        expected: u64,
    },

    /// Reading the source failed.
    #[error("source read failed after {moved} bytes: {source}")]
    Source {
        /// Bytes moved before the failure.
        moved: u64,
        /// Underlying error.
        source: io::Error,
    },

    /// Writing the sink failed.
    #[error("sink write failed after {moved} bytes: {source}")]
    Sink {
        /// Bytes read from the source, including the chunk that failed.
        moved: u64,
        /// Underlying error.
        source: io::Error,
    },
}

impl RelayError {
    /// Bytes consumed from the source before the copy stopped.
    pub fn consumed(&self) -> u64 {
        match self {
            RelayError::ShortRead { moved, .. }
            | RelayError::Source { moved, .. }
            | RelayError::Sink { moved, .. } => *moved,
        }
    }

    /// Whether the failure is on the source side.
    pub fn is_source(&self) -> bool {
        !matches!(self, RelayError::Sink { .. })
    }
}

impl From<RelayError> for Error {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::ShortRead { .. } => Error::Integrity(e.to_string()),
            RelayError::Source { .. } | RelayError::Sink { .. } => Error::Transport(e.to_string()),
        }
    }
}

/// Copy exactly `len` bytes from `reader` to `writer`.
///
/// When a transfer is attached, its progress is updated per chunk and the
/// copy waits while the transfer is paused, both before reading a chunk
/// and before writing one that was read while a pause arrived. A read
/// returning zero before `len` bytes is a [`RelayError::ShortRead`].
pub async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    transfer: Option<&Transfer>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut moved = 0u64;

    while moved < len {
        if let Some(transfer) = transfer {
            transfer.wait_while_paused().await;
        }

        let want = (len - moved).min(RELAY_CHUNK_SIZE as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|source| RelayError::Source { moved, source })?;
        if n == 0 {
            return Err(RelayError::ShortRead { moved, expected: len });
        }
        if let Some(transfer) = transfer {
            transfer.wait_while_paused().await;
        }

        if let Err(source) = writer.write_all(&buf[..n]).await {
            return Err(RelayError::Sink {
                moved: moved + n as u64,
                source,
            });
        }
        moved += n as u64;
        if let Some(transfer) = transfer {
            transfer.add_progress(n as u64);
        }
    }

    writer
        .flush()
        .await
        .map_err(|source| RelayError::Sink { moved, source })?;
    Ok(moved)
}

/// Read and discard exactly `len` bytes. Returns the bytes discarded,
/// which is less than `len` only if the source ended.
pub async fn drain_exact<R>(reader: &mut R, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut limited = reader.take(len);
    tokio::io::copy(&mut limited, &mut tokio::io::sink()).await
}

/// Write `len` zero bytes.
pub async fn pad_zeros<W>(writer: &mut W, len: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let zeros = [0u8; RELAY_CHUNK_SIZE];
    let mut left = len;
    while left > 0 {
        let n = left.min(RELAY_CHUNK_SIZE as u64) as usize;
        writer.write_all(&zeros[..n]).await?;
        left -= n as u64;
    }
    writer.flush().await
}
