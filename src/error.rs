//! Error types for the chat server
//!
//! Defines startup errors and hub send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Server-level errors
///
/// Only these are fatal to the whole process. Per-connection failures are
/// logged inside the owning session and never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error on the listening socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hub send errors
///
/// Occurs when the hub has shut down and dropped its receiver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
