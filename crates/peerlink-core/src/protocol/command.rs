//! Command grammar shared by the server and client read loops.

use crate::error::{Error, Result};
use crate::registry::PeerId;
use std::fmt;
use std::str::FromStr;

/// Separator between a file name and its checksum in `/FILE_RESPONSE`.
pub const CHECKSUM_SEPARATOR: char = '|';

/// One control line of the protocol.
///
/// Commands that announce a binary payload (`FileRequest`, `FileResponse`,
/// `FolderRequest`, `FolderResponse`, `LookResponse`) are followed on the
/// stream by exactly `size` raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A plain line: chat content, a notice or a sealed payload.
    Chat(String),
    /// Orderly disconnect.
    Exit,
    /// Heartbeat from the server.
    Ping,
    /// Heartbeat reply from a client.
    Pong,
    /// Ask for the list of known peers.
    Status,
    /// Header of a status reply; `count` peer lines follow.
    Users {
        /// Number of peer lines that follow.
        count: usize,
    },
    /// Registration accepted.
    Welcome {
        /// Id assigned to the new peer.
        id: PeerId,
        /// Display name as registered.
        name: String,
    },
    /// The connection was matched to a known offline peer and reactivated.
    Reconnect {
        /// Display name of the reactivated peer.
        name: String,
        /// Id of the reactivated peer.
        id: PeerId,
    },
    /// Sender asks the server to relay a file.
    FileRequest {
        /// Recipient id.
        peer: PeerId,
        /// Bare file name.
        name: String,
        /// Payload length in bytes.
        size: u64,
        /// Hex digest of the file, if declared.
        checksum: Option<String>,
    },
    /// Server announces a relayed file to its recipient.
    FileResponse {
        /// Recipient id.
        peer: PeerId,
        /// Bare file name.
        name: String,
        /// Hex digest declared by the sender.
        checksum: Option<String>,
        /// Payload length in bytes.
        size: u64,
        /// Recipient's declared storage root.
        storage_root: String,
    },
    /// Sender asks the server to relay a zipped folder.
    FolderRequest {
        /// Recipient id.
        peer: PeerId,
        /// Folder name.
        name: String,
        /// Archive length in bytes.
        size: u64,
    },
    /// Server announces a relayed folder archive to its recipient.
    FolderResponse {
        /// Recipient id.
        peer: PeerId,
        /// Folder name.
        name: String,
        /// Archive length in bytes.
        size: u64,
        /// Recipient's declared storage root.
        storage_root: String,
    },
    /// Ask the server for another peer's storage listing.
    Look {
        /// Peer whose storage root should be listed.
        peer: PeerId,
    },
    /// Server asks a peer to list its storage root for `requester`.
    LookRequest {
        /// Storage root to enumerate.
        storage_root: String,
        /// Peer that asked for the listing.
        requester: PeerId,
    },
    /// A listing of `size` bytes follows.
    ///
    /// Sent by the target with the requester's id; forwarded by the server
    /// with the target's id.
    LookResponse {
        /// Addressee (target to server) or responder (server to requester).
        peer: PeerId,
        /// Listing length in bytes.
        size: u64,
    },
    /// Ask a peer to send a file or folder.
    ///
    /// Client to server: `peer` is the target. Server to target: `peer` is
    /// the requester the content must be sent to.
    DownloadRequest {
        /// Target or requester, depending on direction.
        peer: PeerId,
        /// Path on the target's machine.
        path: String,
    },
}

impl Command {
    /// Classify one line read by the server from a client.
    ///
    /// `USERS:` only heads a status reply travelling to a client, so from
    /// a client it is the start of an ordinary chat line.
    pub fn parse_request(line: &str) -> Result<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.starts_with(super::USERS_SENTINEL) {
            return Ok(Command::Chat(trimmed.to_string()));
        }
        Command::parse(line)
    }

    /// Classify one line (without its terminator).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(Error::Protocol("empty line".into()));
        }

        match line.trim() {
            "exit" | "/exit" => return Ok(Command::Exit),
            "PING" => return Ok(Command::Ping),
            "PONG" => return Ok(Command::Pong),
            "/status" => return Ok(Command::Status),
            _ => {}
        }

        if let Some(rest) = line.strip_prefix(super::USERS_SENTINEL) {
            let count = rest
                .trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid user count: {}", rest.trim())))?;
            return Ok(Command::Users { count });
        }

        if !line.starts_with('/') {
            return Ok(Command::Chat(line.to_string()));
        }

        let (name, args) = line.split_once(' ').unwrap_or((line, ""));
        match name {
            "/FILE_REQUEST" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                if parts.len() != 3 && parts.len() != 4 {
                    return Err(usage("/FILE_REQUEST <peerId> <fileName> <sizeBytes> [checksum]"));
                }
                Ok(Command::FileRequest {
                    peer: parse_id(parts[0])?,
                    name: parts[1].to_string(),
                    size: parse_size(parts[2])?,
                    checksum: parts.get(3).map(|c| c.to_string()),
                })
            }
            "/FILE_RESPONSE" => {
                let parts = split_fields(args, 4)
                    .ok_or_else(|| usage("/FILE_RESPONSE <peerId> <fileName>[|checksum] <sizeBytes> <storageRoot>"))?;
                let (name, checksum) = match parts[1].split_once(CHECKSUM_SEPARATOR) {
                    Some((name, sum)) if !sum.is_empty() => (name.to_string(), Some(sum.to_string())),
                    Some((name, _)) => (name.to_string(), None),
                    None => (parts[1].to_string(), None),
                };
                Ok(Command::FileResponse {
                    peer: parse_id(parts[0])?,
                    name,
                    checksum,
                    size: parse_size(parts[2])?,
                    storage_root: parts[3].to_string(),
                })
            }
            "/FOLDER_REQUEST" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                if parts.len() != 3 {
                    return Err(usage("/FOLDER_REQUEST <peerId> <folderName> <sizeBytes>"));
                }
                Ok(Command::FolderRequest {
                    peer: parse_id(parts[0])?,
                    name: parts[1].to_string(),
                    size: parse_size(parts[2])?,
                })
            }
            "/FOLDER_RESPONSE" => {
                let parts = split_fields(args, 4)
                    .ok_or_else(|| usage("/FOLDER_RESPONSE <peerId> <folderName> <sizeBytes> <storageRoot>"))?;
                Ok(Command::FolderResponse {
                    peer: parse_id(parts[0])?,
                    name: parts[1].to_string(),
                    size: parse_size(parts[2])?,
                    storage_root: parts[3].to_string(),
                })
            }
            "/LOOK" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                if parts.len() != 1 {
                    return Err(usage("/LOOK <peerId>"));
                }
                Ok(Command::Look { peer: parse_id(parts[0])? })
            }
            "/LOOK_REQUEST" => {
                let (root, requester) = args
                    .trim_end()
                    .rsplit_once(' ')
                    .filter(|(root, _)| !root.trim().is_empty())
                    .ok_or_else(|| usage("/LOOK_REQUEST <storageRoot> <peerId>"))?;
                Ok(Command::LookRequest {
                    storage_root: root.to_string(),
                    requester: parse_id(requester)?,
                })
            }
            "/LOOK_RESPONSE" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                if parts.len() != 2 {
                    return Err(usage("/LOOK_RESPONSE <peerId> <sizeBytes>"));
                }
                Ok(Command::LookResponse {
                    peer: parse_id(parts[0])?,
                    size: parse_size(parts[1])?,
                })
            }
            "/DOWNLOAD_REQUEST" => {
                let parts = split_fields(args, 2).ok_or_else(|| usage("/DOWNLOAD_REQUEST <peerId> <path>"))?;
                Ok(Command::DownloadRequest {
                    peer: parse_id(parts[0])?,
                    path: parts[1].to_string(),
                })
            }
            "/WELCOME" => {
                let parts = split_fields(args, 2).ok_or_else(|| usage("/WELCOME <peerId> <name>"))?;
                Ok(Command::Welcome {
                    id: parse_id(parts[0])?,
                    name: parts[1].to_string(),
                })
            }
            "/RECONNECT" => {
                let (name, id) = args
                    .trim_end()
                    .rsplit_once(' ')
                    .filter(|(name, _)| !name.trim().is_empty())
                    .ok_or_else(|| usage("/RECONNECT <name> <peerId>"))?;
                Ok(Command::Reconnect {
                    name: name.to_string(),
                    id: parse_id(id)?,
                })
            }
            other => Err(Error::Protocol(format!("unknown command: {}", other))),
        }
    }

    /// Payload length announced by this command, if any.
    pub fn payload_len(&self) -> Option<u64> {
        match self {
            Command::FileRequest { size, .. }
            | Command::FileResponse { size, .. }
            | Command::FolderRequest { size, .. }
            | Command::FolderResponse { size, .. }
            | Command::LookResponse { size, .. } => Some(*size),
            _ => None,
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Chat(text) => f.write_str(text),
            Command::Exit => f.write_str("exit"),
            Command::Ping => f.write_str("PING"),
            Command::Pong => f.write_str("PONG"),
            Command::Status => f.write_str("/status"),
            Command::Users { count } => write!(f, "{} {}", super::USERS_SENTINEL, count),
            Command::Welcome { id, name } => write!(f, "/WELCOME {} {}", id, name),
            Command::Reconnect { name, id } => write!(f, "/RECONNECT {} {}", name, id),
            Command::FileRequest { peer, name, size, checksum } => {
                write!(f, "/FILE_REQUEST {} {} {}", peer, name, size)?;
                if let Some(sum) = checksum {
                    write!(f, " {}", sum)?;
                }
                Ok(())
            }
            Command::FileResponse { peer, name, checksum, size, storage_root } => match checksum {
                Some(sum) => write!(
                    f,
                    "/FILE_RESPONSE {} {}{}{} {} {}",
                    peer, name, CHECKSUM_SEPARATOR, sum, size, storage_root
                ),
                None => write!(f, "/FILE_RESPONSE {} {} {} {}", peer, name, size, storage_root),
            },
            Command::FolderRequest { peer, name, size } => {
                write!(f, "/FOLDER_REQUEST {} {} {}", peer, name, size)
            }
            Command::FolderResponse { peer, name, size, storage_root } => {
                write!(f, "/FOLDER_RESPONSE {} {} {} {}", peer, name, size, storage_root)
            }
            Command::Look { peer } => write!(f, "/LOOK {}", peer),
            Command::LookRequest { storage_root, requester } => {
                write!(f, "/LOOK_REQUEST {} {}", storage_root, requester)
            }
            Command::LookResponse { peer, size } => write!(f, "/LOOK_RESPONSE {} {}", peer, size),
            Command::DownloadRequest { peer, path } => write!(f, "/DOWNLOAD_REQUEST {} {}", peer, path),
        }
    }
}

/// Whether `name` can travel as a single protocol token.
///
/// Names are whitespace-delimited on the wire and `|` separates the
/// checksum in `/FILE_RESPONSE`.
pub fn is_valid_token(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(|c| c.is_whitespace() || c == CHECKSUM_SEPARATOR)
}

fn split_fields(args: &str, n: usize) -> Option<Vec<&str>> {
    let parts: Vec<&str> = args.splitn(n, ' ').collect();
    if parts.len() == n && parts.iter().all(|p| !p.trim().is_empty()) {
        Some(parts)
    } else {
        None
    }
}

fn parse_id(token: &str) -> Result<PeerId> {
    token
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid peer id: {}", token.trim())))
}

fn parse_size(token: &str) -> Result<u64> {
    token
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid size: {}", token.trim())))
}

fn usage(text: &str) -> Error {
    Error::Protocol(format!("usage: {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> PeerId {
        PeerId::new(n)
    }

    #[test]
    fn test_plain_line_is_chat() {
        assert_eq!(Command::parse("hello there").unwrap(), Command::Chat("hello there".into()));
        assert_eq!(Command::parse("ENC:abc-_").unwrap(), Command::Chat("ENC:abc-_".into()));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(Command::parse("exit").unwrap(), Command::Exit);
        assert_eq!(Command::parse("/exit\r\n").unwrap(), Command::Exit);
        assert_eq!(Command::parse("PING").unwrap(), Command::Ping);
        assert_eq!(Command::parse("PONG\n").unwrap(), Command::Pong);
        assert_eq!(Command::parse("/status").unwrap(), Command::Status);
        assert_eq!(Command::parse("USERS: 3").unwrap(), Command::Users { count: 3 });
    }

    #[test]
    fn test_users_prefix_from_a_client_is_chat() {
        assert_eq!(
            Command::parse_request("USERS: are you there\r\n").unwrap(),
            Command::Chat("USERS: are you there".into())
        );
        assert_eq!(Command::parse_request("USERS: 3").unwrap(), Command::Chat("USERS: 3".into()));
        assert!(Command::parse("USERS: are you there").is_err());
        assert_eq!(Command::parse_request("/status").unwrap(), Command::Status);
        assert_eq!(Command::parse_request("hello").unwrap(), Command::Chat("hello".into()));
    }

    #[test]
    fn test_file_request_with_and_without_checksum() {
        assert_eq!(
            Command::parse("/FILE_REQUEST 2 report.txt 13").unwrap(),
            Command::FileRequest { peer: id(2), name: "report.txt".into(), size: 13, checksum: None }
        );
        assert_eq!(
            Command::parse("/FILE_REQUEST 2 report.txt 13 abcd").unwrap(),
            Command::FileRequest {
                peer: id(2),
                name: "report.txt".into(),
                size: 13,
                checksum: Some("abcd".into())
            }
        );
    }

    #[test]
    fn test_file_response_splits_checksum_and_keeps_root_spaces() {
        let cmd = Command::parse("/FILE_RESPONSE 7 report.txt|beef 13 /home/b/My Files").unwrap();
        assert_eq!(
            cmd,
            Command::FileResponse {
                peer: id(7),
                name: "report.txt".into(),
                checksum: Some("beef".into()),
                size: 13,
                storage_root: "/home/b/My Files".into(),
            }
        );
        assert_eq!(cmd.to_string(), "/FILE_RESPONSE 7 report.txt|beef 13 /home/b/My Files");
        assert_eq!(cmd.payload_len(), Some(13));
    }

    #[test]
    fn test_look_request_root_with_spaces() {
        assert_eq!(
            Command::parse("/LOOK_REQUEST /srv/shared stuff 4").unwrap(),
            Command::LookRequest { storage_root: "/srv/shared stuff".into(), requester: id(4) }
        );
    }

    #[test]
    fn test_reconnect_and_welcome() {
        assert_eq!(
            Command::parse("/RECONNECT Mary Ann 12").unwrap(),
            Command::Reconnect { name: "Mary Ann".into(), id: id(12) }
        );
        assert_eq!(
            Command::parse("/WELCOME 12 Mary Ann").unwrap(),
            Command::Welcome { id: id(12), name: "Mary Ann".into() }
        );
    }

    #[test]
    fn test_malformed_commands_are_protocol_errors() {
        for line in [
            "/FILE_REQUEST 2 report.txt",
            "/FILE_REQUEST 2 report.txt thirteen",
            "/FILE_REQUEST bob report.txt 13",
            "/FOLDER_REQUEST 2 photos",
            "/LOOK",
            "/LOOK_RESPONSE 2",
            "/DOWNLOAD_REQUEST 2",
            "/NOPE 1 2",
            "USERS: many",
            "   ",
        ] {
            match Command::parse(line) {
                Err(Error::Protocol(_)) => {}
                other => panic!("expected protocol error for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_display_matches_wire_format() {
        let cmd = Command::FolderRequest { peer: id(3), name: "photos".into(), size: 2048 };
        assert_eq!(cmd.to_string(), "/FOLDER_REQUEST 3 photos 2048");
        assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);

        let cmd = Command::DownloadRequest { peer: id(1), path: "docs/a b.txt".into() };
        assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
    }

    #[test]
    fn test_token_validation() {
        assert!(is_valid_token("report.txt"));
        assert!(!is_valid_token("my report.txt"));
        assert!(!is_valid_token("a|b"));
        assert!(!is_valid_token(""));
    }
}
