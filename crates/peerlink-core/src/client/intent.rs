//! Parsing of user input into client actions.

use crate::error::{Error, Result};
use crate::registry::PeerId;
use crate::transfer::TransferId;
use std::path::PathBuf;

/// Help text for the interactive client.
pub const HELP_TEXT: &str = "\
Commands:
  /sendfile <peerId> <path>     send a file
  /sendfolder <peerId> <path>   send a folder (zipped in transit)
  /download <peerId> <path>     ask a peer to send you a file or folder
  /look <peerId>                list a peer's shared storage
  /status                       list known users
  /transfers                    list transfers of this session
  /pause <transferId>           pause a transfer
  /resume <transferId>          resume a paused transfer
  /help                         show this help
  exit                          leave the chat
Anything else is sent as a chat message.";

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Chat message.
    Chat(String),
    /// Send a file.
    SendFile {
        /// Recipient.
        to: PeerId,
        /// Local path.
        path: PathBuf,
    },
    /// Send a folder.
    SendFolder {
        /// Recipient.
        to: PeerId,
        /// Local path.
        path: PathBuf,
    },
    /// Ask a peer for a file or folder.
    Download {
        /// Peer holding the content.
        from: PeerId,
        /// Path on that peer.
        path: String,
    },
    /// List a peer's storage.
    Look(PeerId),
    /// List known peers.
    Status,
    /// List local transfers.
    Transfers,
    /// Pause a transfer.
    Pause(TransferId),
    /// Resume a transfer.
    Resume(TransferId),
    /// Show help.
    Help,
    /// Leave.
    Exit,
    /// Blank input.
    Nothing,
}

impl Intent {
    /// Classify one input line.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Intent::Nothing);
        }
        if input == "exit" || input == "/exit" {
            return Ok(Intent::Exit);
        }
        if !input.starts_with('/') {
            return Ok(Intent::Chat(input.to_string()));
        }

        let mut parts = input.splitn(3, ' ');
        let command = parts.next().unwrap_or_default();
        let first = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

        match command {
            "/sendfile" => {
                let (to, path) = peer_and_path(first, rest, "/sendfile <peerId> <path>")?;
                Ok(Intent::SendFile { to, path: PathBuf::from(path) })
            }
            "/sendfolder" => {
                let (to, path) = peer_and_path(first, rest, "/sendfolder <peerId> <path>")?;
                Ok(Intent::SendFolder { to, path: PathBuf::from(path) })
            }
            "/download" => {
                let (from, path) = peer_and_path(first, rest, "/download <peerId> <path>")?;
                Ok(Intent::Download { from, path })
            }
            "/look" => match (first, rest) {
                (Some(peer), None) => Ok(Intent::Look(peer_id(peer)?)),
                _ => Err(usage("/look <peerId>")),
            },
            "/status" => Ok(Intent::Status),
            "/transfers" => Ok(Intent::Transfers),
            "/pause" => match (first, rest) {
                (Some(id), None) => Ok(Intent::Pause(id.parse()?)),
                _ => Err(usage("/pause <transferId>")),
            },
            "/resume" => match (first, rest) {
                (Some(id), None) => Ok(Intent::Resume(id.parse()?)),
                _ => Err(usage("/resume <transferId>")),
            },
            "/help" => Ok(Intent::Help),
            other => Err(Error::Protocol(format!("unknown command {} (try /help)", other))),
        }
    }
}

fn peer_and_path(first: Option<&str>, rest: Option<&str>, text: &str) -> Result<(PeerId, String)> {
    match (first, rest) {
        (Some(peer), Some(path)) => Ok((peer_id(peer)?, path.to_string())),
        _ => Err(usage(text)),
    }
}

fn peer_id(token: &str) -> Result<PeerId> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid peer id: {}", token)))
}

fn usage(text: &str) -> Error {
    Error::Protocol(format!("usage: {}", text))
}
