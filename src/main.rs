//! Line-based TCP Chat Server - Entry Point
//!
//! Parses the command line, installs logging, then binds and serves.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_hub::config::{
    DEFAULT_ADDRESS, DEFAULT_BACKLOG_LIMIT, DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_STALL_TIMEOUT, DEFAULT_TIMEOUT,
};
use chat_hub::{ChatServer, OverflowPolicy, ServerConfig};

/// Multi-client line-based TCP chat server
#[derive(Parser, Debug)]
#[command(name = "chat_hub", version, about, long_about = None)]
struct Cli {
    /// Address to bind
    #[arg(long, env = "CHAT_HUB_ADDRESS", default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Port to bind
    #[arg(long, env = "CHAT_HUB_PORT", default_value = DEFAULT_PORT)]
    port: String,

    /// Debug logging, with source locations
    #[arg(long, env = "CHAT_HUB_DEBUG")]
    debug: bool,

    /// Seconds a new client has to send its name
    #[arg(long, env = "CHAT_HUB_NAMING_TIMEOUT", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    naming_timeout: u64,

    /// Seconds of silence before a client is disconnected
    #[arg(long, env = "CHAT_HUB_IDLE_TIMEOUT", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    idle_timeout: u64,

    /// Capacity of each client's inbound and outbound queue
    #[arg(long, env = "CHAT_HUB_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Longest accepted line, in bytes
    #[arg(long, env = "CHAT_HUB_MAX_LINE_LENGTH", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,

    /// What to do with a client whose outbound queue is full
    #[arg(long, env = "CHAT_HUB_OVERFLOW", value_enum, default_value_t = OverflowPolicy::Disconnect)]
    overflow: OverflowPolicy,

    /// Lines buffered for a client whose queue is full
    #[arg(long, env = "CHAT_HUB_BACKLOG_LIMIT", default_value_t = DEFAULT_BACKLOG_LIMIT)]
    backlog_limit: usize,

    /// Milliseconds a backlogged client may go without draining before it is dropped
    #[arg(long, env = "CHAT_HUB_STALL_TIMEOUT_MS", default_value_t = DEFAULT_STALL_TIMEOUT.as_millis() as u64)]
    stall_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            address: self.address,
            port: self.port,
            naming_timeout: Duration::from_secs(self.naming_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            queue_capacity: self.queue_capacity,
            max_line_length: self.max_line_length,
            overflow_policy: self.overflow,
            backlog_limit: self.backlog_limit,
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let default_filter = if cli.debug {
        "chat_hub=debug"
    } else {
        "chat_hub=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_file(cli.debug)
        .with_line_number(cli.debug)
        .init();

    let server = ChatServer::bind(cli.into_config()).await?;
    info!("Chat server bound to {}", server.local_addr()?);

    // Ctrl-C goes through the same path as the /shutdown command
    let hub = server.hub();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            hub.shutdown().await;
        }
    });

    server.serve().await?;

    Ok(())
}
