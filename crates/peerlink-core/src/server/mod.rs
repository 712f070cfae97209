//! Relay server.
//!
//! One task per accepted connection plus one heartbeat task. All tasks
//! share a [`ServerState`]; nothing is process-global.

mod session;

pub use session::serve_connection;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::crypto::MessageCipher;
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::registry::Registry;
use crate::transfer::TransferManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// State shared by every session of one server.
pub struct ServerState {
    /// Server configuration.
    pub config: ServerConfig,
    /// Peer table.
    pub registry: Registry,
    /// Fan-out engine.
    pub broadcaster: Broadcaster,
    /// Relays in flight.
    pub transfers: TransferManager,
}

impl ServerState {
    /// Build fresh state.
    pub fn new(config: ServerConfig, cipher: Option<MessageCipher>) -> Arc<Self> {
        let registry = Registry::new();
        let broadcaster = Broadcaster::new(registry.clone(), cipher.map(Arc::new));
        Arc::new(Self {
            config,
            registry,
            broadcaster,
            transfers: TransferManager::new(),
        })
    }

    /// Heartbeat monitor for this state.
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(
            self.registry.clone(),
            self.broadcaster.clone(),
            self.config.heartbeat_interval,
        )
        .with_eviction(self.config.eviction_grace)
    }
}

/// Stops the heartbeat when the accept loop goes away.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A bound server, ready to accept connections.
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listener. A port already in use is a startup error.
    pub async fn bind(config: ServerConfig, cipher: Option<MessageCipher>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| Error::Startup(format!("cannot listen on {}: {}", config.listen_addr, e)))?;
        Ok(Self {
            state: ServerState::new(config, cipher),
            listener,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Startup(e.to_string()))
    }

    /// Shared state, for inspection.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let heartbeat = self.state.heartbeat().spawn();
        let _abort_heartbeat = AbortOnDrop(heartbeat);
        info!(
            address = %self.local_addr()?,
            heartbeat_secs = self.state.config.heartbeat_interval.as_secs(),
            encrypted = self.state.broadcaster.cipher().is_some(),
            "peerlink server started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(?addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Could not set TCP_NODELAY");
                    }
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        if let Err(e) = serve_connection(state, reader, writer, Some(addr)).await {
                            warn!(?addr, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
