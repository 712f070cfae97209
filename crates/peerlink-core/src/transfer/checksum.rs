//! SHA-256 file digests.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Hex SHA-256 of a file, streamed.
pub async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.map_err(|e| Error::resource(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer).await.map_err(|e| Error::resource(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Re-read `path` and compare against the declared digest.
pub async fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = file_checksum(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )))
    }
}
