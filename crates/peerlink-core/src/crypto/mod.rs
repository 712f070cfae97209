//! Payload sealing for the optional encryption mode.
//!
//! Encryption is peer-to-server only. Commands and binary payloads are never
//! sealed; handshake fields, chat lines and notices are.

mod cipher;

pub use cipher::{is_sealed, open, seal, MessageCipher, KEY_SIZE, SEALED_PREFIX};
