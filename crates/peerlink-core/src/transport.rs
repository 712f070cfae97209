//! Write half of a peer connection.
//!
//! Every write to a peer goes through its [`Transport`], which owns the
//! socket's write half behind an async mutex. A relay holds the guard for
//! the whole header-plus-payload sequence, so broadcasts and heartbeats
//! can never interleave bytes into a payload.

use crate::error::Result;
use crate::protocol::write_line;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Exclusive access to a peer's writer.
pub type WriterGuard<'a> = MutexGuard<'a, BoxedWriter>;

/// Outcome of [`Transport::send_line_or_defer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written immediately.
    Sent,
    /// Queued behind a writer that was busy, typically with a payload.
    Deferred,
}

/// Serialized writer for one connection.
pub struct Transport {
    writer: Mutex<BoxedWriter>,
    remote: Option<SocketAddr>,
}

impl Transport {
    /// Wrap a write half.
    pub fn new<W>(writer: W, remote: Option<SocketAddr>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            remote,
        }
    }

    /// Remote address of the connection, if known.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Write one line.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, line).await?;
        Ok(())
    }

    /// Write a header line followed by a payload as one unit.
    pub async fn send_blob(&self, header: &str, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, header).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write one line now if the writer is free, otherwise queue it behind
    /// the current holder on a background task.
    ///
    /// Waiters acquire the writer in FIFO order, so queued lines keep their
    /// relative order.
    pub async fn send_line_or_defer(self: &Arc<Self>, line: String) -> Result<Delivery> {
        if let Some(mut writer) = self.try_lock() {
            write_line(&mut *writer, &line).await?;
            return Ok(Delivery::Sent);
        }

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transport.send_line(&line).await {
                tracing::debug!(remote = ?transport.remote, error = %e, "Deferred write failed");
            }
        });
        Ok(Delivery::Deferred)
    }

    /// Wait for exclusive access to the writer.
    pub async fn lock(&self) -> WriterGuard<'_> {
        self.writer.lock().await
    }

    /// Take the writer if nobody else holds it.
    pub fn try_lock(&self) -> Option<WriterGuard<'_>> {
        self.writer.try_lock().ok()
    }

    /// Shut down the write half.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Transport shutdown failed");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("remote", &self.remote).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_line_and_blob() {
        let (near, mut far) = tokio::io::duplex(1024);
        let transport = Transport::new(near, None);
        transport.send_line("PING").await.unwrap();
        transport.send_blob("/LOOK_RESPONSE 1 3", b"abc").await.unwrap();
        drop(transport);

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"PING\n/LOOK_RESPONSE 1 3\nabc");
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let (near, _far) = tokio::io::duplex(64);
        let transport = Transport::new(near, None);
        let guard = transport.lock().await;
        assert!(transport.try_lock().is_none());
        drop(guard);
        assert!(transport.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_deferred_line_lands_after_payload() {
        let (near, mut far) = tokio::io::duplex(1024);
        let transport = Arc::new(Transport::new(near, None));

        let mut guard = transport.lock().await;
        let delivery = transport.send_line_or_defer("later".into()).await.unwrap();
        assert_eq!(delivery, Delivery::Deferred);
        guard.write_all(b"payload").await.unwrap();
        drop(guard);

        let mut buf = vec![0u8; b"payloadlater\n".len()];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"payloadlater\n");
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_fails() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let transport = Transport::new(near, None);
        let err = transport.send_line("PING").await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
