//! # peerlink core library
//!
//! A peer-registry chat and file/folder transfer relay. A central server
//! accepts TCP connections, tracks each as a named peer, fans chat out to
//! every online peer and forwards files, zipped folders and storage
//! listings between two peers byte for byte, without keeping any of it.
//!
//! ## Guarantees
//!
//! - Ids are unique for the lifetime of a server
//! - Writes to one peer never interleave: every write goes through the
//!   peer's [`transport::Transport`]
//! - A relay moves exactly the declared number of bytes or fails
//! - A single bad peer never takes the server down
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            server  │  client                 │
//! ├──────────────────────────────────────────────┤
//! │ broadcast │ heartbeat │ transfer │  lookup   │
//! ├──────────────────────────────────────────────┤
//! │   registry   │  protocol (lines)  │ crypto   │
//! ├──────────────────────────────────────────────┤
//! │                 transport                    │
//! └──────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod broadcast;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod lookup;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
