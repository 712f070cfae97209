//! Fan-out of lines to every online peer.
//!
//! Membership is snapshotted and the registry lock released before any
//! write, so a slow peer never holds up registry mutation. A peer whose
//! writer is busy with a payload gets the line queued behind it instead of
//! stalling the fan-out.

use crate::crypto::{seal, MessageCipher};
use crate::error::Result;
use crate::message::Notice;
use crate::registry::{Peer, PeerId, Registry};
use crate::transport::Delivery;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one fan-out.
#[derive(Debug, Default, Clone)]
pub struct BroadcastReport {
    /// Peers the line was written to.
    pub delivered: Vec<PeerId>,
    /// Peers the line was queued for behind an active payload.
    pub deferred: Vec<PeerId>,
    /// Peers whose write failed.
    pub failed: Vec<PeerId>,
}

impl BroadcastReport {
    /// Number of peers that received or will receive the line.
    pub fn reached(&self) -> usize {
        self.delivered.len() + self.deferred.len()
    }
}

/// Broadcast engine bound to one registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Registry,
    cipher: Option<Arc<MessageCipher>>,
}

impl Broadcaster {
    /// Create a broadcaster.
    pub fn new(registry: Registry, cipher: Option<Arc<MessageCipher>>) -> Self {
        Self { registry, cipher }
    }

    /// Cipher used for sealing, if configured.
    pub fn cipher(&self) -> Option<&MessageCipher> {
        self.cipher.as_deref()
    }

    /// Encode a chat or notice line for the wire.
    pub fn seal(&self, text: &str) -> Result<String> {
        seal(self.cipher(), text)
    }

    /// Write `line` unchanged to every online peer.
    ///
    /// Individual failures are collected, never propagated.
    pub async fn send_raw(&self, line: &str) -> BroadcastReport {
        let peers = self.registry.snapshot_online().await;
        let mut report = BroadcastReport::default();

        for peer in peers {
            match peer.transport.send_line_or_defer(line.to_string()).await {
                Ok(Delivery::Sent) => report.delivered.push(peer.id),
                Ok(Delivery::Deferred) => report.deferred.push(peer.id),
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "Broadcast write failed");
                    report.failed.push(peer.id);
                }
            }
        }

        debug!(
            delivered = report.delivered.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Seal `text`, broadcast it and demote every peer the write failed for.
    pub async fn announce(&self, text: &str) -> Result<BroadcastReport> {
        let line = self.seal(text)?;
        let report = self.send_raw(&line).await;
        self.demote(&report.failed).await;
        Ok(report)
    }

    /// Send a sealed line to a single peer.
    pub async fn notify(&self, peer: &Peer, text: &str) -> Result<Delivery> {
        let line = self.seal(text)?;
        peer.transport.send_line_or_defer(line).await
    }

    /// Mark peers offline and broadcast one departure notice per peer.
    ///
    /// Peers already offline produce no notice. Failures while announcing
    /// a departure demote those peers in turn. Returns the peers that were
    /// actually demoted.
    pub async fn demote(&self, ids: &[PeerId]) -> Vec<PeerId> {
        let mut pending: VecDeque<PeerId> = ids.iter().copied().collect();
        let mut demoted = Vec::new();

        while let Some(id) = pending.pop_front() {
            match self.registry.mark_offline(id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(peer = %id, error = %e, "Demotion skipped");
                    continue;
                }
            }
            demoted.push(id);

            let name = match self.registry.get(id).await {
                Some(peer) => peer.name,
                None => continue,
            };
            info!(peer = %id, name = %name, "Peer went offline");

            match self.seal(&Notice::Departed(name).to_string()) {
                Ok(line) => pending.extend(self.send_raw(&line).await.failed),
                Err(e) => warn!(error = %e, "Could not seal departure notice"),
            }
        }
        demoted
    }

    /// Departure path for a session that ended on its own.
    pub async fn depart(&self, peer: &Peer) {
        if self.registry.release(peer.id, &peer.transport).await {
            info!(peer = %peer.id, name = %peer.name, "Peer went offline");
            match self.seal(&Notice::Departed(peer.name.clone()).to_string()) {
                Ok(line) => {
                    let report = self.send_raw(&line).await;
                    self.demote(&report.failed).await;
                }
                Err(e) => warn!(error = %e, "Could not seal departure notice"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_line;
    use crate::transport::Transport;
    use tokio::io::{BufReader, DuplexStream};

    async fn join(registry: &Registry, name: &str) -> (PeerId, BufReader<DuplexStream>) {
        let (near, far) = tokio::io::duplex(4096);
        let id = registry.allocate_id();
        registry
            .register(Peer::new(id, name, "/tmp", Arc::new(Transport::new(near, None))))
            .await
            .unwrap();
        (id, BufReader::new(far))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_online_peer() {
        let registry = Registry::new();
        let (_, mut a) = join(&registry, "a").await;
        let (_, mut b) = join(&registry, "b").await;
        let (c, _c_reader) = join(&registry, "c").await;
        registry.mark_offline(c).await.unwrap();

        let broadcaster = Broadcaster::new(registry, None);
        let report = broadcaster.announce("hello").await.unwrap();

        assert_eq!(report.delivered.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(read_line(&mut a, 1024).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(read_line(&mut b, 1024).await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_dead_peer_does_not_block_others() {
        let registry = Registry::new();
        let (_, mut a) = join(&registry, "a").await;
        let (dead, dead_reader) = join(&registry, "dead").await;
        let (_, mut b) = join(&registry, "b").await;
        drop(dead_reader);

        let broadcaster = Broadcaster::new(registry.clone(), None);
        let report = broadcaster.announce("hi").await.unwrap();

        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.failed, vec![dead]);
        assert!(!registry.get(dead).await.unwrap().online);

        for reader in [&mut a, &mut b] {
            assert_eq!(read_line(&mut *reader, 1024).await.unwrap().as_deref(), Some("hi"));
            assert_eq!(
                read_line(&mut *reader, 1024).await.unwrap().as_deref(),
                Some("User dead is now offline")
            );
        }
    }

    #[tokio::test]
    async fn test_demote_announces_once() {
        let registry = Registry::new();
        let (a, _a_reader) = join(&registry, "a").await;
        let (_, mut b) = join(&registry, "b").await;

        let broadcaster = Broadcaster::new(registry, None);
        assert_eq!(broadcaster.demote(&[a, a]).await, vec![a]);
        assert!(broadcaster.demote(&[a]).await.is_empty());

        assert_eq!(
            read_line(&mut b, 1024).await.unwrap().as_deref(),
            Some("User a is now offline")
        );
        broadcaster.send_raw("marker").await;
        assert_eq!(read_line(&mut b, 1024).await.unwrap().as_deref(), Some("marker"));
    }

    #[tokio::test]
    async fn test_sealed_broadcast() {
        let registry = Registry::new();
        let (_, mut a) = join(&registry, "a").await;
        let cipher = Arc::new(MessageCipher::from_secret("s3cret").unwrap());
        let broadcaster = Broadcaster::new(registry, Some(cipher.clone()));

        broadcaster.announce("classified").await.unwrap();
        let line = read_line(&mut a, 1024).await.unwrap().unwrap();
        assert!(crate::crypto::is_sealed(&line));
        assert_eq!(cipher.decrypt(&line).unwrap(), "classified");
    }
}
