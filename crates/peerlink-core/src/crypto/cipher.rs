//! Line-level envelope: ChaCha20-Poly1305 under a key derived from a
//! shared secret.
//!
//! A sealed line is `ENC:` followed by base64url(nonce || ciphertext || tag).
//! The URL-safe alphabet has no `:` or `/`, so a sealed line can never be
//! mistaken for a command.

use crate::error::{Error, Result};
use crate::logging::Redacted;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Key length in bytes.
pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Marker that prefixes every sealed payload.
pub const SEALED_PREFIX: &str = "ENC:";

const KDF_SALT: &[u8] = b"peerlink/v1";
const KDF_INFO: &[u8] = b"peerlink message cipher";

/// Symmetric cipher shared by a client and the server.
pub struct MessageCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MessageCipher {
    /// Derive the cipher key from a shared secret string.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Crypto("empty secret".into()));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Hkdf::<Sha256>::new(Some(KDF_SALT), secret.as_bytes())
            .expand(KDF_INFO, &mut key[..])
            .map_err(|_| Error::Crypto("key derivation failed".into()))?;
        Ok(Self { key })
    }

    /// Seal a plaintext into an `ENC:` line. Each call draws a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, URL_SAFE_NO_PAD.encode(blob)))
    }

    /// Open an `ENC:` line.
    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let encoded = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| Error::Crypto("missing envelope prefix".into()))?;
        let blob = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| Error::Crypto("invalid base64".into()))?;
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        // Every authentication failure reports the same error.
        let plaintext = Zeroizing::new(
            self.aead()
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| Error::Crypto("decryption failed".into()))?,
        );
        String::from_utf8(plaintext.to_vec()).map_err(|_| Error::Crypto("invalid utf-8".into()))
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }
}

impl fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCipher")
            .field("key", &Redacted(&self.key))
            .finish()
    }
}

/// Whether a line carries a sealed payload.
pub fn is_sealed(line: &str) -> bool {
    line.starts_with(SEALED_PREFIX)
}

/// Encode an outgoing payload for the configured mode.
pub fn seal(cipher: Option<&MessageCipher>, text: &str) -> Result<String> {
    match cipher {
        Some(cipher) => cipher.encrypt(text),
        None => Ok(text.to_string()),
    }
}

/// Decode an incoming payload, failing closed on a mode mismatch.
pub fn open(cipher: Option<&MessageCipher>, line: &str) -> Result<String> {
    match (cipher, is_sealed(line)) {
        (Some(cipher), true) => cipher.decrypt(line),
        (Some(_), false) => Err(Error::Crypto("expected a sealed payload".into())),
        (None, true) => Err(Error::Crypto("sealed payload but no key configured".into())),
        (None, false) => Ok(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(secret: &str) -> MessageCipher {
        MessageCipher::from_secret(secret).expect("derive cipher")
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher("correct horse");
        let sealed = seal(Some(&c), "alice: hi there").expect("seal");
        assert!(is_sealed(&sealed));
        assert!(!sealed.contains("hi there"));
        assert_eq!(open(Some(&c), &sealed).expect("open"), "alice: hi there");
    }

    #[test]
    fn test_sealed_line_never_looks_like_command() {
        let c = cipher("k");
        for _ in 0..32 {
            let sealed = c.encrypt("/FILE_REQUEST 1 a 2").expect("seal");
            assert!(!sealed.starts_with('/'));
            assert!(!sealed.contains('\n'));
        }
    }

    #[test]
    fn test_same_secret_same_key() {
        let sealed = cipher("shared").encrypt("x").expect("seal");
        assert_eq!(cipher("shared").decrypt(&sealed).expect("open"), "x");
    }

    #[test]
    fn test_tampered_line_fails() {
        let c = cipher("k");
        let mut sealed = c.encrypt("payload").expect("seal");
        let last = sealed.pop().expect("non-empty");
        sealed.push(if last == 'A' { 'B' } else { 'A' });
        assert!(c.decrypt(&sealed).is_err());
        assert!(c.decrypt("ENC:AAAA").is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher("one").encrypt("secret").expect("seal");
        assert!(open(Some(&cipher("two")), &sealed).is_err());
    }

    #[test]
    fn test_mode_mismatch_fails_closed() {
        let c = cipher("k");
        let sealed = c.encrypt("hello").expect("seal");
        assert!(open(None, &sealed).is_err());
        assert!(open(Some(&c), "hello").is_err());
        assert_eq!(open(None, "hello").expect("plain"), "hello");
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(MessageCipher::from_secret("").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        assert!(format!("{:?}", cipher("k")).contains("[REDACTED]"));
    }
}
