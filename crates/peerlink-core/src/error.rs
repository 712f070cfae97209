//! Error types for peerlink.
//!
//! Variants follow the failure taxonomy of the relay: transport failures end
//! a session, protocol and integrity failures only skip the offending
//! command, resource failures are reported back to the requesting peer.

use thiserror::Error;

/// Core error type for peerlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket read/write failure, reset or premature close.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed command, wrong argument count or non-numeric size.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Moved byte count differs from the declared size, or checksum mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// File or folder missing, permission denied, directory walk failure.
    #[error("{0}")]
    Resource(String),

    /// Sealing or opening a payload failed.
    /// Details are intentionally vague.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Peer or transfer not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A peer with this id is already registered.
    #[error("peer already registered: {0}")]
    AlreadyRegistered(String),

    /// Transfer state machine rejected the transition.
    #[error("invalid transfer state: {0}")]
    InvalidState(String),

    /// Listener could not be started.
    #[error("startup error: {0}")]
    Startup(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using peerlink's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the connection it happened on is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout)
    }

    /// Wrap a filesystem error with the path it concerns.
    pub fn resource(path: impl AsRef<std::path::Path>, e: std::io::Error) -> Self {
        Error::Resource(format!("{}: {}", path.as_ref().display(), e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::Transport("reset".into()).is_disconnect());
        assert!(Error::Timeout.is_disconnect());
        assert!(!Error::Protocol("bad size".into()).is_disconnect());
        assert!(!Error::Integrity("short".into()).is_disconnect());
    }

    #[test]
    fn test_crypto_error_is_vague() {
        let e = Error::Crypto("tag mismatch at byte 7".into());
        assert_eq!(e.to_string(), "cryptographic operation failed");
    }

    #[test]
    fn test_resource_error_names_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e = Error::resource("/tmp/missing.txt", io);
        assert!(e.to_string().contains("/tmp/missing.txt"));
    }
}
