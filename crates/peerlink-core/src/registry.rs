//! Peer registry.
//!
//! The registry is the only shared mutable structure of the server. It is
//! constructed explicitly and handed to every session, the broadcaster and
//! the heartbeat, so tests can run isolated instances side by side.
//!
//! All mutation happens under one `RwLock`. Iteration for I/O is done on
//! snapshots so no socket write ever runs while the lock is held.

use crate::error::{Error, Result};
use crate::transport::Transport;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Server-assigned peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(PeerId)
    }
}

/// One registered participant.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Server-assigned id.
    pub id: PeerId,
    /// Display name, fixed at registration.
    pub name: String,
    /// Declared storage root, fixed at registration.
    pub storage_root: String,
    /// Writer of the current connection.
    pub transport: Arc<Transport>,
    /// Whether the peer currently has a live session.
    pub online: bool,
    /// IP address the current connection came from.
    pub remote_ip: Option<IpAddr>,
    /// When the peer went offline.
    pub offline_since: Option<Instant>,
}

impl Peer {
    /// New online peer record.
    pub fn new(
        id: PeerId,
        name: impl Into<String>,
        storage_root: impl Into<String>,
        transport: Arc<Transport>,
    ) -> Self {
        let remote_ip = transport.remote().map(|addr| addr.ip());
        Self {
            id,
            name: name.into(),
            storage_root: storage_root.into(),
            transport,
            online: true,
            remote_ip,
            offline_since: None,
        }
    }

    /// Status line used in `/status` replies.
    pub fn status_line(&self) -> String {
        let state = if self.online { "online" } else { "offline" };
        format!("{} (id {}) is {}", self.name, self.id, state)
    }
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<PeerId, Peer>,
}

/// Concurrency-safe table of all known peers.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id. Ids are never reused.
    pub fn allocate_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Insert a peer. Fails if the id is already present.
    pub async fn register(&self, peer: Peer) -> Result<Peer> {
        let mut inner = self.inner.write().await;
        if inner.peers.contains_key(&peer.id) {
            return Err(Error::AlreadyRegistered(peer.id.to_string()));
        }
        tracing::debug!(peer = %peer.id, name = %peer.name, "Peer registered");
        inner.peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    /// Mark a peer online.
    pub async fn mark_online(&self, id: PeerId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let peer = inner
            .peers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        peer.online = true;
        peer.offline_since = None;
        Ok(())
    }

    /// Mark a peer offline.
    ///
    /// Returns `true` only if the peer was online, so callers can emit
    /// exactly one departure notice per online period.
    pub async fn mark_offline(&self, id: PeerId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let peer = inner
            .peers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        Ok(take_offline(peer))
    }

    /// Mark a peer offline if `transport` is still its current connection.
    ///
    /// A session that ends after its peer has already reconnected on a
    /// new socket must not demote the new session.
    pub async fn release(&self, id: PeerId, transport: &Arc<Transport>) -> bool {
        let mut inner = self.inner.write().await;
        match inner.peers.get_mut(&id) {
            Some(peer) if Arc::ptr_eq(&peer.transport, transport) => take_offline(peer),
            _ => false,
        }
    }

    /// Point lookup.
    pub async fn get(&self, id: PeerId) -> Option<Peer> {
        self.inner.read().await.peers.get(&id).cloned()
    }

    /// Lookup that only succeeds for online peers.
    pub async fn get_online(&self, id: PeerId) -> Result<Peer> {
        match self.get(id).await {
            Some(peer) if peer.online => Ok(peer),
            _ => Err(Error::NotFound(format!("user {} is not online", id))),
        }
    }

    /// Online peers at this instant.
    pub async fn snapshot_online(&self) -> Vec<Peer> {
        let inner = self.inner.read().await;
        let mut peers: Vec<Peer> = inner.peers.values().filter(|p| p.online).cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// All known peers at this instant, ordered by id.
    pub async fn snapshot_all(&self) -> Vec<Peer> {
        let inner = self.inner.read().await;
        let mut peers: Vec<Peer> = inner.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Most recently registered offline peer last seen at `ip`.
    pub async fn find_offline_by_addr(&self, ip: IpAddr) -> Option<PeerId> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter(|p| !p.online && p.remote_ip == Some(ip))
            .map(|p| p.id)
            .max()
    }

    /// Bring an offline peer back on a new connection.
    pub async fn reactivate(&self, id: PeerId, transport: Arc<Transport>) -> Result<Peer> {
        let mut inner = self.inner.write().await;
        let peer = inner
            .peers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        if peer.online {
            return Err(Error::AlreadyRegistered(format!("peer {} is already online", id)));
        }
        peer.remote_ip = transport.remote().map(|addr| addr.ip());
        peer.transport = transport;
        peer.online = true;
        peer.offline_since = None;
        Ok(peer.clone())
    }

    /// Remove peers that have been offline for longer than `grace`.
    pub async fn evict_stale(&self, grace: Duration) -> Vec<Peer> {
        let mut inner = self.inner.write().await;
        let stale: Vec<PeerId> = inner
            .peers
            .values()
            .filter(|p| matches!(p.offline_since, Some(since) if since.elapsed() >= grace))
            .map(|p| p.id)
            .collect();
        stale.iter().filter_map(|id| inner.peers.remove(id)).collect()
    }

    /// Number of known peers, online or not.
    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    /// Whether no peer is known.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }
}

fn take_offline(peer: &mut Peer) -> bool {
    if !peer.online {
        return false;
    }
    peer.online = false;
    peer.offline_since = Some(Instant::now());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn transport() -> Arc<Transport> {
        let (near, _far) = tokio::io::duplex(64);
        Arc::new(Transport::new(near, None))
    }

    fn transport_from(ip: [u8; 4]) -> Arc<Transport> {
        let (near, _far) = tokio::io::duplex(64);
        Arc::new(Transport::new(near, Some((ip, 40000).into())))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        registry
            .register(Peer::new(id, "alice", "/tmp/a", transport()))
            .await
            .unwrap();

        let peer = registry.get(id).await.unwrap();
        assert_eq!(peer.name, "alice");
        assert!(peer.online);
        assert!(registry.get(PeerId::new(999)).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        registry.register(Peer::new(id, "a", "/a", transport())).await.unwrap();
        let err = registry.register(Peer::new(id, "b", "/b", transport())).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(registry.get(id).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_unique() {
        let registry = Registry::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = registry.allocate_id();
                registry
                    .register(Peer::new(id, format!("p{}", i), "/r", transport()))
                    .await
                    .map(|p| p.id)
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(registry.snapshot_online().await.len(), 32);
    }

    #[tokio::test]
    async fn test_mark_offline_reports_change_once() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        registry.register(Peer::new(id, "a", "/a", transport())).await.unwrap();

        assert!(registry.mark_offline(id).await.unwrap());
        assert!(!registry.mark_offline(id).await.unwrap());
        assert!(registry.snapshot_online().await.is_empty());
        assert_eq!(registry.snapshot_all().await.len(), 1);

        registry.mark_online(id).await.unwrap();
        assert!(registry.mark_offline(id).await.unwrap());
        assert!(matches!(
            registry.mark_offline(PeerId::new(77)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_ignores_stale_transport() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        let old = transport_from([10, 0, 0, 5]);
        registry.register(Peer::new(id, "a", "/a", old.clone())).await.unwrap();
        registry.mark_offline(id).await.unwrap();

        let new = transport_from([10, 0, 0, 5]);
        registry.reactivate(id, new.clone()).await.unwrap();

        assert!(!registry.release(id, &old).await);
        assert!(registry.get(id).await.unwrap().online);
        assert!(registry.release(id, &new).await);
        assert!(!registry.get(id).await.unwrap().online);
    }

    #[tokio::test]
    async fn test_find_offline_by_addr() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry
            .register(Peer::new(a, "a", "/a", transport_from([10, 0, 0, 1])))
            .await
            .unwrap();
        registry
            .register(Peer::new(b, "b", "/b", transport_from([10, 0, 0, 2])))
            .await
            .unwrap();

        let ip: IpAddr = [10, 0, 0, 1].into();
        assert_eq!(registry.find_offline_by_addr(ip).await, None);
        registry.mark_offline(a).await.unwrap();
        assert_eq!(registry.find_offline_by_addr(ip).await, Some(a));
    }

    #[tokio::test]
    async fn test_reactivate_online_peer_fails() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        registry.register(Peer::new(id, "a", "/a", transport())).await.unwrap();
        assert!(registry.reactivate(id, transport()).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_stale_only_removes_offline() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry.register(Peer::new(a, "a", "/a", transport())).await.unwrap();
        registry.register(Peer::new(b, "b", "/b", transport())).await.unwrap();
        registry.mark_offline(a).await.unwrap();

        let evicted = registry.evict_stale(Duration::ZERO).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, a);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(b).await.is_some());
    }

    #[test]
    fn test_peer_id_parse_and_display() {
        let id: PeerId = "42".parse().unwrap();
        assert_eq!(id, PeerId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("x".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_status_line() {
        let mut peer = Peer::new(PeerId::new(3), "carol", "/c", transport());
        assert_eq!(peer.status_line(), "carol (id 3) is online");
        peer.online = false;
        assert_eq!(peer.status_line(), "carol (id 3) is offline");
    }
}
