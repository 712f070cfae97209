//! Transfer bookkeeping and the pause/resume state machine.

use crate::error::{Error, Result};
use crate::registry::PeerId;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

/// What is being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// A single file.
    File,
    /// A zipped folder.
    Folder,
    /// A storage listing.
    Listing,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::File => f.write_str("file"),
            TransferKind::Folder => f.write_str("folder"),
            TransferKind::Listing => f.write_str("listing"),
        }
    }
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    /// Bytes are moving.
    Active = 0,
    /// Suspended until resumed.
    Paused = 1,
    /// All declared bytes moved.
    Completed = 2,
    /// Aborted before completion.
    Failed = 3,
}

impl TransferStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransferStatus::Active,
            1 => TransferStatus::Paused,
            2 => TransferStatus::Completed,
            _ => TransferStatus::Failed,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Active => f.write_str("active"),
            TransferStatus::Paused => f.write_str("paused"),
            TransferStatus::Completed => f.write_str("completed"),
            TransferStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Which way the bytes go, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by this side.
    Outbound,
    /// Received by this side.
    Inbound,
    /// Forwarded between two other parties.
    Relay,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("out"),
            Direction::Inbound => f.write_str("in"),
            Direction::Relay => f.write_str("relay"),
        }
    }
}

/// Local transfer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(TransferId)
            .map_err(|_| Error::Protocol(format!("invalid transfer id: {}", s.trim())))
    }
}

/// One in-flight relay operation.
///
/// Status and progress are atomics so the relay loop and the controlling
/// side can touch them without a lock.
pub struct Transfer {
    /// Identifier.
    pub id: TransferId,
    /// File, folder or listing.
    pub kind: TransferKind,
    /// File or folder name.
    pub name: String,
    /// Byte count announced in the header.
    pub declared_size: u64,
    /// Local direction.
    pub direction: Direction,
    /// Counterparty.
    pub peer: PeerId,
    /// Declared hex digest, for files.
    pub checksum: Option<String>,
    status: AtomicU8,
    bytes_moved: AtomicU64,
    resumed: Notify,
}

impl Transfer {
    fn new(
        id: TransferId,
        kind: TransferKind,
        name: String,
        declared_size: u64,
        direction: Direction,
        peer: PeerId,
        checksum: Option<String>,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            declared_size,
            direction,
            peer,
            checksum,
            status: AtomicU8::new(TransferStatus::Active as u8),
            bytes_moved: AtomicU64::new(0),
            resumed: Notify::new(),
        }
    }

    /// Current status.
    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Bytes moved so far.
    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Acquire)
    }

    /// Record progress.
    pub fn add_progress(&self, n: u64) {
        self.bytes_moved.fetch_add(n, Ordering::AcqRel);
    }

    /// Active -> Paused.
    pub fn pause(&self) -> Result<()> {
        self.transition(TransferStatus::Active, TransferStatus::Paused)
    }

    /// Paused -> Active.
    pub fn resume(&self) -> Result<()> {
        self.transition(TransferStatus::Paused, TransferStatus::Active)?;
        self.resumed.notify_waiters();
        Ok(())
    }

    /// Active or Paused -> Completed. Fails the transfer if the byte count
    /// is off.
    ///
    /// A pause that lands after the last chunk has no bytes left to hold
    /// back, so a paused transfer with every byte moved completes too.
    pub fn complete(&self) -> Result<()> {
        let moved = self.bytes_moved();
        if moved != self.declared_size {
            self.fail();
            return Err(Error::Integrity(format!(
                "{} moved {} of {} bytes",
                self.name, moved, self.declared_size
            )));
        }
        let finished = self
            .transition(TransferStatus::Active, TransferStatus::Completed)
            .or_else(|_| self.transition(TransferStatus::Paused, TransferStatus::Completed));
        if finished.is_ok() {
            self.resumed.notify_waiters();
        }
        finished
    }

    /// Mark failed from any non-terminal state.
    pub fn fail(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if TransferStatus::from_u8(current).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                current,
                TransferStatus::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.resumed.notify_waiters();
    }

    /// Return once the transfer is no longer paused.
    pub async fn wait_while_paused(&self) {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status() != TransferStatus::Paused {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, from: TransferStatus, to: TransferStatus) -> Result<()> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::InvalidState(format!(
                    "transfer {} is {}, expected {}",
                    self.id,
                    TransferStatus::from_u8(actual),
                    from
                ))
            })
    }

    /// One-line summary for listings.
    pub fn summary(&self) -> String {
        format!(
            "#{} {} {} {} peer {} {}/{} bytes {}",
            self.id,
            self.direction,
            self.kind,
            self.name,
            self.peer,
            self.bytes_moved(),
            self.declared_size,
            self.status()
        )
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("declared_size", &self.declared_size)
            .field("bytes_moved", &self.bytes_moved())
            .field("status", &self.status())
            .finish()
    }
}

/// Parameters of a new transfer.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    /// File, folder or listing.
    pub kind: TransferKind,
    /// File or folder name.
    pub name: String,
    /// Declared byte count.
    pub size: u64,
    /// Local direction.
    pub direction: Direction,
    /// Counterparty.
    pub peer: PeerId,
    /// Declared hex digest.
    pub checksum: Option<String>,
}

/// Table of transfers known to one process.
#[derive(Clone, Default)]
pub struct TransferManager {
    transfers: Arc<RwLock<HashMap<TransferId, Arc<Transfer>>>>,
    next_id: Arc<AtomicU64>,
}

impl TransferManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new active transfer.
    pub async fn begin(&self, spec: TransferSpec) -> Arc<Transfer> {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let transfer = Arc::new(Transfer::new(
            id,
            spec.kind,
            spec.name,
            spec.size,
            spec.direction,
            spec.peer,
            spec.checksum,
        ));
        self.transfers.write().await.insert(id, Arc::clone(&transfer));
        debug!(transfer = %id, kind = %transfer.kind, size = transfer.declared_size, "Transfer started");
        transfer
    }

    /// Look up a transfer.
    pub async fn get(&self, id: TransferId) -> Result<Arc<Transfer>> {
        self.transfers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))
    }

    /// All transfers, oldest first.
    pub async fn list(&self) -> Vec<Arc<Transfer>> {
        let mut transfers: Vec<_> = self.transfers.read().await.values().cloned().collect();
        transfers.sort_by_key(|t| t.id);
        transfers
    }

    /// Pause an active transfer.
    pub async fn pause(&self, id: TransferId) -> Result<()> {
        self.get(id).await?.pause()?;
        info!(transfer = %id, "Transfer paused");
        Ok(())
    }

    /// Resume a paused transfer.
    pub async fn resume(&self, id: TransferId) -> Result<()> {
        self.get(id).await?.resume()?;
        info!(transfer = %id, "Transfer resumed");
        Ok(())
    }

    /// Drop a transfer from the table.
    pub async fn remove(&self, id: TransferId) -> Option<Arc<Transfer>> {
        self.transfers.write().await.remove(&id)
    }

    /// Drop every completed or failed transfer.
    pub async fn prune_finished(&self) -> usize {
        let mut transfers = self.transfers.write().await;
        let before = transfers.len();
        transfers.retain(|_, t| !t.status().is_terminal());
        before - transfers.len()
    }
}
