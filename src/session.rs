//! Client session
//!
//! One session per accepted TCP connection. A session runs a reader task
//! (socket -> inbound queue), a writer task (outbound queue -> socket) and
//! its own main loop, which walks through
//! `Connecting -> Naming -> Active -> Leaving -> Closed`.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{self, Effect, COMMAND_MARKER};
use crate::config::ServerConfig;
use crate::diagnostics::Diagnostics;
use crate::hub::{HubHandle, JoinOutcome, SessionHandle};
use crate::types::SessionId;

/// First line sent on every connection
pub const NAME_PROMPT: &str = "Input your name:";

/// How long the writer may keep flushing after the session has closed
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Why an active session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Normal leave, announced to the others
    Leave(&'static str),
    /// Server shutdown or eviction; no announcement
    Forced,
}

/// A single client connection
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    hub: HubHandle,
    config: Arc<ServerConfig>,
    /// Forced-disconnect signal
    kick: CancellationToken,
    /// Server start time, for uptime in diagnostics
    started: Instant,
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        hub: HubHandle,
        config: Arc<ServerConfig>,
        kick: CancellationToken,
        started: Instant,
    ) -> Self {
        Self {
            id: SessionId::new(),
            peer,
            hub,
            config,
            kick,
            started,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drive the connection until it is closed
    ///
    /// Returns once the main loop has finished, the reader has been stopped
    /// and the writer has drained (or its grace period ran out).
    pub async fn run(self, stream: TcpStream) {
        info!(session = %self.id, peer = %self.peer, "Client connected");

        let capacity = self.config.queue_capacity.max(1);
        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, mut inbound) = mpsc::channel(capacity);
        let (outbound, outbound_rx) = mpsc::channel(capacity);

        let lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(self.config.max_line_length),
        );
        let reader = tokio::spawn(read_lines(lines, inbound_tx, self.id));
        let sink = FramedWrite::new(write_half, LinesCodec::new());
        let writer = tokio::spawn(write_lines(sink, outbound_rx, self.id));

        if let Some(name) = self.negotiate_name(&mut inbound, &outbound).await {
            match self.active(&name, &mut inbound, &outbound).await {
                Departure::Leave(reason) => {
                    info!(session = %self.id, name = %name, reason, "Client leaving");
                    self.hub.leave(self.id, name).await;
                }
                Departure::Forced => {
                    info!(session = %self.id, name = %name, "Client forcibly disconnected");
                }
            }
        }

        // Closed
        drop(outbound);
        drop(inbound);
        reader.abort();

        let writer_abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
            debug!(session = %self.id, "Writer did not drain in time, aborting");
            writer_abort.abort();
        }

        info!(session = %self.id, peer = %self.peer, "Client disconnected");
    }

    /// Prompt for a name and register it with the hub
    async fn negotiate_name(
        &self,
        inbound: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<String>,
    ) -> Option<String> {
        self.send(outbound, NAME_PROMPT.to_string()).await?;

        let line = tokio::select! {
            biased;
            _ = self.kick.cancelled() => return None,
            line = inbound.recv() => line?,
            _ = tokio::time::sleep(self.config.naming_timeout) => {
                info!(session = %self.id, "Naming timed out");
                return None;
            }
        };

        let name = line.trim().to_string();
        if name.is_empty() || name.starts_with(COMMAND_MARKER) {
            warn!(session = %self.id, name = %name, "Invalid name");
            let _ = self.send(outbound, format!("Invalid name: {}", name)).await;
            return None;
        }

        let handle = SessionHandle {
            id: self.id,
            outbound: outbound.clone(),
            kick: self.kick.clone(),
        };
        match self.hub.join(name.clone(), handle).await {
            Ok(JoinOutcome::Joined) => Some(name),
            Ok(JoinOutcome::Overloaded) => {
                debug!(session = %self.id, name = %name, "Join refused, roster not deliverable");
                None
            }
            Ok(JoinOutcome::NameTaken) => {
                let _ = self
                    .send(outbound, format!("Name {} is already in use", name))
                    .await;
                None
            }
            Err(e) => {
                debug!(session = %self.id, "Hub unavailable during naming: {}", e);
                None
            }
        }
    }

    /// Main loop of a registered session
    async fn active(
        &self,
        name: &str,
        inbound: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<String>,
    ) -> Departure {
        loop {
            tokio::select! {
                biased;
                _ = self.kick.cancelled() => return Departure::Forced,
                line = inbound.recv() => match line {
                    Some(line) => {
                        if self.apply(name, &line, outbound).await.is_break() {
                            if self.kick.is_cancelled() {
                                return Departure::Forced;
                            }
                            return Departure::Leave("quit");
                        }
                    }
                    None => return Departure::Leave("connection closed"),
                },
                _ = tokio::time::sleep(self.config.idle_timeout) => {
                    return Departure::Leave("idle timeout");
                }
            }
        }
    }

    /// Carry out the effect of one inbound line
    ///
    /// Breaks when the session should stop: a soft leave, or a forced
    /// disconnect observed while replying.
    async fn apply(
        &self,
        name: &str,
        line: &str,
        outbound: &mpsc::Sender<String>,
    ) -> ControlFlow<()> {
        let effect = command::process(line, name);
        if line.starts_with(COMMAND_MARKER) {
            info!(session = %self.id, name = %name, command = %line, "Command received");
        }

        match effect {
            Effect::None => {}
            Effect::Broadcast(text) => self.hub.broadcast(text).await,
            Effect::Reply(lines) => return self.reply(outbound, lines).await,
            Effect::Whisper { to, text } => {
                self.hub.whisper(name.to_string(), to, text).await;
            }
            Effect::List => match self.hub.list().await {
                Ok(names) => return self.reply(outbound, names).await,
                Err(e) => debug!(session = %self.id, "List unavailable: {}", e),
            },
            Effect::Diagnostics => match self.hub.stats().await {
                Ok(stats) => {
                    let lines = Diagnostics::collect(stats, self.started).lines();
                    return self.reply(outbound, lines).await;
                }
                Err(e) => debug!(session = %self.id, "Stats unavailable: {}", e),
            },
            Effect::Shutdown => {
                info!(session = %self.id, name = %name, "Shutdown requested by client");
                self.hub.shutdown().await;
            }
            Effect::Leave => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn reply(&self, outbound: &mpsc::Sender<String>, lines: Vec<String>) -> ControlFlow<()> {
        for line in lines {
            if self.send(outbound, line).await.is_none() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Queue one line for the writer, giving up on a forced disconnect
    async fn send(&self, outbound: &mpsc::Sender<String>, line: String) -> Option<()> {
        tokio::select! {
            biased;
            _ = self.kick.cancelled() => None,
            result = outbound.send(line) => result.ok(),
        }
    }
}

/// Socket -> inbound queue. Ends on EOF or read error, closing the queue.
async fn read_lines(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    inbound: mpsc::Sender<String>,
    id: SessionId,
) {
    while let Some(result) = lines.next().await {
        match result {
            Ok(line) => {
                debug!(session = %id, "<< {:?}", line);
                if line.is_empty() {
                    continue;
                }
                if inbound.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(session = %id, "Read error: {}", e);
                break;
            }
        }
    }
    debug!(session = %id, "Read task ended");
}

/// Outbound queue -> socket. Write failures are logged, not fatal.
async fn write_lines(
    mut sink: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut outbound: mpsc::Receiver<String>,
    id: SessionId,
) {
    while let Some(msg) = outbound.recv().await {
        debug!(session = %id, ">> {:?}", msg);
        if let Err(e) = sink.send(msg).await {
            error!(session = %id, "Failed to write message: {}", e);
        }
    }

    let _ = SinkExt::<String>::close(&mut sink).await;
    debug!(session = %id, "Write task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::config::BackPressure;
    use crate::hub::Hub;

    const WAIT: Duration = Duration::from_secs(2);

    type Client = (
        FramedRead<OwnedReadHalf, LinesCodec>,
        FramedWrite<OwnedWriteHalf, LinesCodec>,
    );

    /// Start one session on a loopback socket and connect a client to it
    async fn start(config: ServerConfig) -> (Client, HubHandle, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let (hub, handle) = Hub::channel(32, shutdown.clone(), BackPressure::default());
        tokio::spawn(hub.run());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let session = Session::new(
            peer,
            handle.clone(),
            Arc::new(config),
            shutdown.child_token(),
            Instant::now(),
        );
        let task = tokio::spawn(session.run(stream));

        let (r, w) = client.into_split();
        let client = (
            FramedRead::new(r, LinesCodec::new()),
            FramedWrite::new(w, LinesCodec::new()),
        );
        (client, handle, task)
    }

    async fn next_line(client: &mut Client) -> Option<String> {
        tokio::time::timeout(WAIT, client.0.next())
            .await
            .expect("timed out waiting for a line")
            .map(|r| r.unwrap())
    }

    #[tokio::test]
    async fn test_prompt_then_roster() {
        let (mut client, hub, _task) = start(ServerConfig::default()).await;

        assert_eq!(next_line(&mut client).await.unwrap(), NAME_PROMPT);
        client.1.send("alice").await.unwrap();
        assert_eq!(next_line(&mut client).await.unwrap(), "1 clients: alice");
        assert_eq!(hub.list().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_name_is_trimmed() {
        let (mut client, hub, _task) = start(ServerConfig::default()).await;

        next_line(&mut client).await.unwrap();
        client.1.send("  alice \r").await.unwrap();
        assert_eq!(next_line(&mut client).await.unwrap(), "1 clients: alice");
        assert_eq!(hub.list().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let (mut client, hub, task) = start(ServerConfig::default()).await;

        next_line(&mut client).await.unwrap();
        client.1.send("/list").await.unwrap();
        assert_eq!(next_line(&mut client).await.unwrap(), "Invalid name: /list");
        assert_eq!(next_line(&mut client).await, None);

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(hub.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_naming_timeout_closes_connection() {
        let config = ServerConfig {
            naming_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let (mut client, hub, task) = start(config).await;

        assert_eq!(next_line(&mut client).await.unwrap(), NAME_PROMPT);
        assert_eq!(next_line(&mut client).await, None);

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(hub.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quit_leaves() {
        let (mut client, hub, task) = start(ServerConfig::default()).await;

        next_line(&mut client).await.unwrap();
        client.1.send("alice").await.unwrap();
        next_line(&mut client).await.unwrap();

        client.1.send("/quit").await.unwrap();
        assert_eq!(next_line(&mut client).await, None);

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(hub.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_session() {
        let (mut client, hub, _task) = start(ServerConfig::default()).await;

        next_line(&mut client).await.unwrap();
        client.1.send("alice").await.unwrap();
        next_line(&mut client).await.unwrap();

        client.1.send("/dance").await.unwrap();
        assert_eq!(
            next_line(&mut client).await.unwrap(),
            command::UNKNOWN_COMMAND
        );
        assert_eq!(hub.list().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_diagnostics_reply() {
        let (mut client, _hub, _task) = start(ServerConfig::default()).await;

        next_line(&mut client).await.unwrap();
        client.1.send("alice").await.unwrap();
        next_line(&mut client).await.unwrap();

        client.1.send("/stats").await.unwrap();
        assert!(next_line(&mut client).await.unwrap().starts_with("chat_hub "));
        let mut found = false;
        while let Some(line) = next_line(&mut client).await {
            if line == "Connected clients: 1" {
                found = true;
            }
            if line.starts_with("Uptime: ") {
                break;
            }
        }
        assert!(found);
    }
}
