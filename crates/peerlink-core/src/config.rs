//! Runtime configuration for the server and client sessions.

use crate::protocol::DEFAULT_MAX_LINE_LEN;
use std::net::SocketAddr;
use std::time::Duration;

/// Default TCP port of the server.
pub const DEFAULT_PORT: u16 = 8080;

/// Default interval between heartbeat ticks (seconds).
pub const DEFAULT_HEARTBEAT_SECS: u64 = 100;

/// How long a client waits for a `/RECONNECT` line before registering.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Dial timeout used by the client reachability check.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Reactivate an offline peer when a connection arrives from its IP.
    pub reconnect_by_address: bool,
    /// Evict peers that stayed offline longer than this. `None` keeps
    /// them for the lifetime of the server.
    pub eviction_grace: Option<Duration>,
    /// Maximum length of one control line.
    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reconnect_by_address: true,
            eviction_grace: None,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    /// Wait for a reconnect signal before sending credentials.
    pub reconnect_wait: Duration,
    /// Timeout for establishing the TCP connection.
    pub dial_timeout: Duration,
    /// Maximum length of one control line.
    pub max_line_len: usize,
}

impl ClientConfig {
    /// Configuration with defaults for the given server address.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}
