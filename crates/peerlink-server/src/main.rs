//! peerlink relay server
//!
//! Accepts client connections, keeps the peer registry, broadcasts chat
//! and relays file, folder and listing payloads between peers. Nothing
//! that passes through is written to disk.

use anyhow::{Context, Result};
use clap::Parser;
use peerlink_core::config::{ServerConfig, DEFAULT_HEARTBEAT_SECS, DEFAULT_PORT};
use peerlink_core::crypto::MessageCipher;
use peerlink_core::logging::Redacted;
use peerlink_core::server::Server;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// peerlink server - chat and file relay for a group of peers
#[derive(Parser, Debug)]
#[command(name = "peerlink-server")]
#[command(author, version, about)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Seconds between heartbeat pings
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_SECS)]
    heartbeat_secs: u64,

    /// Forget peers that stay offline this many seconds (default: never)
    #[arg(long)]
    evict_after_secs: Option<u64>,

    /// Do not resume offline sessions by client address
    #[arg(long)]
    no_reconnect: bool,

    /// Shared secret for sealing chat and handshake lines
    #[arg(long, env = "PEERLINK_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::new(self.host, self.port),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            reconnect_by_address: !self.no_reconnect,
            eviction_grace: self.evict_after_secs.map(Duration::from_secs),
            ..ServerConfig::default()
        }
    }

    fn cipher(&self) -> Result<Option<MessageCipher>> {
        self.secret_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(MessageCipher::from_secret)
            .transpose()
            .context("Invalid secret key")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.server_config();
    let cipher = args.cipher()?;
    info!(
        addr = %config.listen_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        encrypted = cipher.is_some(),
        secret = ?args.secret_key.as_ref().map(Redacted),
        "Starting peerlink server"
    );

    let server = Server::bind(config, cipher)
        .await
        .context("Failed to start server")?;

    tokio::select! {
        result = server.run() => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
