//! Server configuration
//!
//! The core only needs the bind address and port as plain strings; the
//! remaining knobs have defaults matching the reference deployment.

use std::time::Duration;

/// Default bind address
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// Default bind port
pub const DEFAULT_PORT: &str = "5555";

/// Default naming and idle timeout (one hour)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default capacity of each session's inbound and outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default maximum accepted line length in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default number of lines the hub buffers for a session whose queue is full
pub const DEFAULT_BACKLOG_LIMIT: usize = 1024;

/// Default time a backlogged session may go without draining a line
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// What the hub does with a session that cannot keep up
///
/// A full outbound queue alone is not overflow: lines are buffered in the
/// hub's backlog for that session and flushed in order as the writer drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Force-disconnect the session once its backlog exceeds the limit or it
    /// drains nothing for the stall timeout
    #[default]
    Disconnect,
    /// Keep the session, discarding the oldest backlogged lines beyond the limit
    DropOldest,
}

/// Back-pressure settings applied by the hub to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackPressure {
    pub policy: OverflowPolicy,
    /// Lines buffered per session beyond its outbound queue
    pub backlog_limit: usize,
    /// Longest a backlogged session may go without progress (Disconnect only)
    pub stall_timeout: Duration,
}

impl Default for BackPressure {
    fn default() -> Self {
        Self {
            policy: OverflowPolicy::default(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Runtime configuration for [`ChatServer`](crate::server::ChatServer)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address or host name to bind
    pub address: String,
    /// Port to bind, kept as a string like the address
    pub port: String,
    /// How long a new connection may take to send its name
    pub naming_timeout: Duration,
    /// How long an active session may stay silent
    pub idle_timeout: Duration,
    /// Capacity of the per-session inbound and outbound queues
    pub queue_capacity: usize,
    /// Lines longer than this are treated as a read error
    pub max_line_length: usize,
    pub overflow_policy: OverflowPolicy,
    /// Lines the hub buffers for a session whose queue is full
    pub backlog_limit: usize,
    pub stall_timeout: Duration,
}

impl ServerConfig {
    /// Create a config for the given address and port with default tuning
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn back_pressure(&self) -> BackPressure {
        BackPressure {
            policy: self.overflow_policy,
            backlog_limit: self.backlog_limit,
            stall_timeout: self.stall_timeout,
        }
    }

    /// `address:port`, bracketing bare IPv6 addresses
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT.to_string(),
            naming_timeout: DEFAULT_TIMEOUT,
            idle_timeout: DEFAULT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            overflow_policy: OverflowPolicy::default(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}
