//! Wire protocol for peerlink.
//!
//! A newline-delimited text protocol carried over plain TCP streams.
//! Control lines may announce a sized binary payload which follows the
//! line immediately on the same stream.
//!
//! ## Framing Rules
//!
//! - One command or chat message per `\n`-terminated line
//! - Trailing `\r` is stripped on read
//! - Lines longer than the configured maximum are rejected
//! - Payload bytes are never line-framed; the reader consumes exactly the
//!   announced length before reading the next line
//!
//! ## Line Layout
//!
//! ```text
//! /FILE_REQUEST <peerId> <fileName> <sizeBytes> [checksum]\n<sizeBytes raw bytes>
//! /LOOK_RESPONSE <peerId> <sizeBytes>\n<sizeBytes listing bytes>
//! <chat text or ENC:...>\n
//! ```

mod command;

pub use command::{is_valid_token, Command, CHECKSUM_SEPARATOR};

use crate::error::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum length of one control line (64 KiB).
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Prefix of the status reply header.
pub const USERS_SENTINEL: &str = "USERS:";

/// Prefix of error notices sent back to a peer.
pub const ERROR_PREFIX: &str = "Error: ";

/// Read one line, without its terminator.
///
/// Returns `Ok(None)` on a clean end of stream. A final line without a
/// terminator is still returned.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max_len {
        return Err(Error::Protocol(format!("line exceeds {} bytes", max_len)));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| Error::Protocol("line is not valid UTF-8".into()))
}

/// Write `line` followed by `\n` and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Format an error notice line.
pub fn error_line(message: impl std::fmt::Display) -> String {
    format!("{}{}", ERROR_PREFIX, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let data: &[u8] = b"hello\r\nworld\nlast";
        let mut reader = BufReader::new(data);
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("world"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_rejects_oversized() {
        let line = format!("{}\n", "x".repeat(100));
        let mut reader = BufReader::new(line.as_bytes());
        match read_line(&mut reader, 16).await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_line_exact_limit_is_accepted() {
        let line = format!("{}\n", "y".repeat(16));
        let mut reader = BufReader::new(line.as_bytes());
        assert_eq!(read_line(&mut reader, 16).await.unwrap().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_line_then_payload_stays_aligned() {
        let data: &[u8] = b"/LOOK_RESPONSE 1 5\nabcdeNEXT\n";
        let mut reader = BufReader::new(data);
        let line = read_line(&mut reader, 64).await.unwrap().unwrap();
        let size = Command::parse(&line).unwrap().payload_len().unwrap();
        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, b"abcde");
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("NEXT"));
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, "PING").await.unwrap();
        assert_eq!(out, b"PING\n");
    }
}
