//! Connection acceptor
//!
//! Binds the listening socket, spawns a [`Session`] per connection and runs
//! the [`Hub`] actor. Serving ends when the hub shuts down: the accept loop
//! stops, the listener is closed and every session task is joined.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{Hub, HubHandle};
use crate::session::Session;

/// Channel buffer size for hub commands
pub const HUB_CHANNEL_SIZE: usize = 256;

/// Pause after a failed accept, to avoid spinning on persistent errors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound, not yet serving, chat server
pub struct ChatServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    hub: Hub,
    handle: HubHandle,
    /// Raised by the hub when it stops
    shutdown: CancellationToken,
}

impl ChatServer {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound; the
    /// server never enters the serving state in that case.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let shutdown = CancellationToken::new();
        let (hub, handle) = Hub::channel(
            HUB_CHANNEL_SIZE,
            shutdown.clone(),
            config.back_pressure(),
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
            hub,
            handle,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the hub, e.g. to request a shutdown from outside
    pub fn hub(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Accept connections until the hub shuts down
    ///
    /// Returns after the listener is closed and all sessions have finished.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self {
            listener,
            config,
            hub,
            handle,
            shutdown,
        } = self;

        let started = Instant::now();
        let hub_task = tokio::spawn(hub.run());
        let mut sessions = JoinSet::new();

        info!(addr = %listener.local_addr()?, "Chat server listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Stopped accepting connections");
                    break;
                }
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        error!("Session task failed: {}", e);
                    }
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let session = Session::new(
                            peer,
                            handle.clone(),
                            config.clone(),
                            shutdown.child_token(),
                            started,
                        );
                        debug!(session = %session.id(), peer = %peer, "Spawning session");
                        sessions.spawn(session.run(stream));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        drop(handle);

        if let Err(e) = hub_task.await {
            error!("Hub task failed: {}", e);
        }

        debug!("Waiting for {} session(s)", sessions.len());
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                error!("Session task failed: {}", e);
            }
        }

        info!("Server stopped cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port().to_string();

        let result = ChatServer::bind(ServerConfig::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_external_shutdown_returns() {
        let server = ChatServer::bind(ServerConfig::new("127.0.0.1", "0"))
            .await
            .unwrap();
        let hub = server.hub();
        let serving = tokio::spawn(server.serve());

        hub.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
