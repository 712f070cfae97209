//! Periodic liveness check.
//!
//! Liveness is inferred from write failure only: a PING that cannot be
//! written proves the peer is gone. A PONG never changes state.

use crate::broadcast::Broadcaster;
use crate::protocol::{write_line, Command};
use crate::registry::{PeerId, Registry};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Upper bound on a single PING write.
pub const PING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one heartbeat tick.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    /// Peers that were sent a PING.
    pub pinged: Vec<PeerId>,
    /// Peers skipped because their writer was busy with a payload.
    pub skipped: Vec<PeerId>,
    /// Peers demoted because the PING could not be written.
    pub demoted: Vec<PeerId>,
    /// Peers removed after staying offline past the grace period.
    pub evicted: Vec<PeerId>,
}

/// Heartbeat monitor bound to one registry.
pub struct Heartbeat {
    registry: Registry,
    broadcaster: Broadcaster,
    interval: Duration,
    eviction_grace: Option<Duration>,
}

impl Heartbeat {
    /// Create a monitor ticking every `interval`.
    pub fn new(registry: Registry, broadcaster: Broadcaster, interval: Duration) -> Self {
        Self {
            registry,
            broadcaster,
            interval,
            eviction_grace: None,
        }
    }

    /// Evict peers offline for longer than `grace` on every tick.
    pub fn with_eviction(mut self, grace: Option<Duration>) -> Self {
        self.eviction_grace = grace;
        self
    }

    /// Run one heartbeat round.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut failed = Vec::new();
        let ping = Command::Ping.to_string();

        for peer in self.registry.snapshot_online().await {
            let Some(mut writer) = peer.transport.try_lock() else {
                report.skipped.push(peer.id);
                continue;
            };
            let sent = tokio::time::timeout(PING_WRITE_TIMEOUT, write_line(&mut *writer, &ping)).await;
            drop(writer);

            match sent {
                Ok(Ok(())) => report.pinged.push(peer.id),
                Ok(Err(e)) => {
                    debug!(peer = %peer.id, error = %e, "PING write failed");
                    failed.push(peer.id);
                }
                Err(_) => {
                    debug!(peer = %peer.id, "PING write timed out");
                    failed.push(peer.id);
                }
            }
        }

        report.demoted = self.broadcaster.demote(&failed).await;

        if let Some(grace) = self.eviction_grace {
            report.evicted = self
                .registry
                .evict_stale(grace)
                .await
                .into_iter()
                .map(|peer| peer.id)
                .collect();
            if !report.evicted.is_empty() {
                info!(count = report.evicted.len(), "Evicted stale peers");
            }
        }

        debug!(
            pinged = report.pinged.len(),
            skipped = report.skipped.len(),
            demoted = report.demoted.len(),
            "Heartbeat tick"
        );
        report
    }

    /// Run ticks forever on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}
