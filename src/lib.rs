//! Line-based TCP Chat Server Library
//!
//! A multi-client chat server over plain TCP, one UTF-8 message per line,
//! built around a single hub actor.
//!
//! # Features
//! - Name negotiation with a naming timeout and unique names
//! - Broadcast chat and private messages (`/w`)
//! - Operator commands: `/list`, `/stats`, `/shutdown`, `/quit`
//! - Idle timeout per session
//! - Graceful shutdown that joins every session
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor and the only owner of the name registry
//! - Each connection is a `Session` with its own reader and writer tasks
//! - Registry lookups are request/response commands to the hub, no locks
//!
//! # Example
//! ```ignore
//! use chat_hub::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChatServer::bind(ServerConfig::new("127.0.0.1", "5555"))
//!         .await
//!         .unwrap();
//!     server.serve().await.unwrap();
//! }
//! ```

pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hub;
pub mod mailbox;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use command::{Effect, COMMAND_MARKER};
pub use config::{BackPressure, OverflowPolicy, ServerConfig};
pub use error::{SendError, ServerError};
pub use hub::{Hub, HubCommand, HubHandle, HubStats, JoinOutcome, SessionHandle};
pub use server::ChatServer;
pub use session::{Session, NAME_PROMPT};
pub use types::SessionId;
