//! File and folder transfers.
//!
//! - [`manager`]: transfer table and the Active/Paused/Completed/Failed
//!   state machine
//! - [`relay`]: exact-length chunked copy, draining and padding
//! - [`checksum`]: SHA-256 digests of received files
//! - [`archive`]: zip codec for folder payloads

pub mod archive;
pub mod checksum;
pub mod manager;
pub mod relay;

pub use archive::{pack_folder, unpack_archive, PackedFolder};
pub use checksum::{checksum_bytes, file_checksum, verify_file};
pub use manager::{
    Direction, Transfer, TransferId, TransferKind, TransferManager, TransferSpec, TransferStatus,
};
pub use relay::{copy_exact, drain_exact, pad_zeros, RelayError, RELAY_CHUNK_SIZE};

/// Sanitize a received file or folder name to prevent path traversal.
pub fn sanitize_name(name: &str) -> String {
    let name = name.replace(['/', '\\', '\0'], "_");
    let name = name.trim_start_matches('.');

    if name.is_empty() {
        format!("file_{}", chrono::Utc::now().timestamp())
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report.txt"), "report.txt");
        assert_eq!(sanitize_name("../../../etc/passwd"), "_.._.._etc_passwd");
        assert_eq!(sanitize_name("..\\windows"), "_windows");
        assert_eq!(sanitize_name(".hidden"), "hidden");
        assert!(sanitize_name("..").starts_with("file_"));
    }
}
