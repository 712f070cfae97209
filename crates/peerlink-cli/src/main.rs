//! peerlink command-line client
//!
//! Joins a peerlink server, shows the group chat and exchanges files and
//! folders with other peers. Type `/help` once connected.

use anyhow::{Context, Result};
use clap::Parser;
use peerlink_core::config::ClientConfig;
use peerlink_core::crypto::MessageCipher;
use tracing_subscriber::EnvFilter;

mod commands;

/// peerlink - chat and file sharing through a relay server
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server address (host:port); prompted for when omitted
    #[arg(short, long)]
    server: Option<String>,

    /// Local storage root, used when resuming a session
    #[arg(long)]
    storage: Option<String>,

    /// Shared secret for sealing chat and handshake lines
    #[arg(long, env = "PEERLINK_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cipher = cli
        .secret_key
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(MessageCipher::from_secret)
        .transpose()
        .context("Invalid secret key")?;

    let mut input = commands::Input::stdin();

    let (config, stream) = match cli.server {
        Some(server) => (ClientConfig::new(server), None),
        None => {
            let (config, stream) = commands::prompt_server(&mut input).await?;
            (config, Some(stream))
        }
    };

    let storage = cli.storage.as_deref().map(commands::expand_path);
    commands::run(config, stream, cipher, storage, &mut input).await
}
