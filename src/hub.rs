//! Hub actor implementation
//!
//! The central actor that owns the registry of named sessions. Every
//! registry read or write is a [`HubCommand`] processed by [`Hub::run`], one
//! at a time, so there is no lock anywhere around the registry.
//!
//! The hub never awaits a session queue. Each registered session gets a
//! [`Mailbox`]; lines that do not fit in its queue are buffered there and
//! flushed on a short tick, and the [`BackPressure`] settings decide when a
//! session that cannot keep up is dropped.

use std::collections::{HashMap, VecDeque};
use std::iter;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackPressure;
use crate::error::SendError;
use crate::mailbox::{Delivery, Mailbox};
use crate::types::SessionId;

/// How often backlogged mailboxes are retried
const FLUSH_INTERVAL: Duration = Duration::from_millis(25);

/// The hub's reference to a registered session
///
/// The session itself stays owned by its own tasks; the hub only keeps the
/// outbound queue and the forced-disconnect token.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    /// Outbound queue drained by the session's writer
    pub outbound: mpsc::Sender<String>,
    /// Forced-disconnect signal
    pub kick: CancellationToken,
}

/// Result of a name negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    NameTaken,
    /// The roster could not be delivered; the session was not registered
    Overloaded,
}

/// Counters reported by `/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently registered sessions
    pub sessions: usize,
    /// Successful joins since start
    pub total_joined: u64,
    /// Messages fanned out to the registry since start
    pub messages_broadcast: u64,
    /// Sessions dropped because they could not keep up
    pub slow_disconnects: u64,
    /// Backlogged lines discarded under the drop-oldest policy
    pub dropped_messages: u64,
}

/// Commands sent from sessions to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// Register `session` under `name` if the name is free
    Join {
        name: String,
        session: SessionHandle,
        reply: oneshot::Sender<JoinOutcome>,
    },
    /// Send `text` to every registered session
    Broadcast { text: String },
    /// Direct message from `from` to `to`
    Whisper {
        from: String,
        to: String,
        text: String,
    },
    /// Snapshot of the registered names
    List { reply: oneshot::Sender<Vec<String>> },
    /// Snapshot of the hub counters
    Stats { reply: oneshot::Sender<HubStats> },
    /// Session `id` registered as `name` is leaving
    Leave { id: SessionId, name: String },
    /// Stop the server
    Shutdown,
}

/// Cloneable sending side of the hub
///
/// Fire-and-forget submissions to a stopped hub are dropped silently;
/// queries report [`SendError::ChannelClosed`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    /// Try to register `session` under `name`
    pub async fn join(
        &self,
        name: String,
        session: SessionHandle,
    ) -> Result<JoinOutcome, SendError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Join {
            name,
            session,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SendError::ChannelClosed)
    }

    pub async fn broadcast(&self, text: String) {
        self.submit_or_drop(HubCommand::Broadcast { text }).await;
    }

    pub async fn whisper(&self, from: String, to: String, text: String) {
        self.submit_or_drop(HubCommand::Whisper { from, to, text })
            .await;
    }

    /// Names currently registered, in no particular order
    pub async fn list(&self) -> Result<Vec<String>, SendError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::List { reply }).await?;
        rx.await.map_err(|_| SendError::ChannelClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, SendError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| SendError::ChannelClosed)
    }

    pub async fn leave(&self, id: SessionId, name: String) {
        self.submit_or_drop(HubCommand::Leave { id, name }).await;
    }

    pub async fn shutdown(&self) {
        self.submit_or_drop(HubCommand::Shutdown).await;
    }

    async fn submit(&self, cmd: HubCommand) -> Result<(), SendError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    async fn submit_or_drop(&self, cmd: HubCommand) {
        if let Err(e) = self.submit(cmd).await {
            debug!("Hub stopped, dropping command: {}", e);
        }
    }
}

/// The Hub actor
///
/// Owns the registry: name -> mailbox.
pub struct Hub {
    clients: HashMap<String, Mailbox>,
    receiver: mpsc::Receiver<HubCommand>,
    /// Server-wide stop signal, observed by the acceptor
    shutdown: CancellationToken,
    back_pressure: BackPressure,
    stats: HubStats,
}

impl Hub {
    /// Create a Hub with the given command receiver
    pub fn new(
        receiver: mpsc::Receiver<HubCommand>,
        shutdown: CancellationToken,
        back_pressure: BackPressure,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            receiver,
            shutdown,
            back_pressure,
            stats: HubStats::default(),
        }
    }

    /// Create a Hub together with its handle
    pub fn channel(
        capacity: usize,
        shutdown: CancellationToken,
        back_pressure: BackPressure,
    ) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(rx, shutdown, back_pressure), HubHandle::new(tx))
    }

    /// Run the Hub event loop
    ///
    /// Processes commands until a `Shutdown` arrives or all handles are
    /// dropped. Either way the server stop signal is raised on exit.
    pub async fn run(mut self) {
        info!("Hub started");

        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle_command(cmd).is_break() {
                        break;
                    }
                }
                _ = flush.tick(), if self.has_backlog() => {
                    self.flush_backlogs();
                }
            }
        }

        self.stop();
        info!("Hub stopped");
    }

    fn handle_command(&mut self, cmd: HubCommand) -> ControlFlow<()> {
        match cmd {
            HubCommand::Join {
                name,
                session,
                reply,
            } => {
                let outcome = self.handle_join(name, session);
                let _ = reply.send(outcome);
            }
            HubCommand::Broadcast { text } => {
                self.fan_out(text, None);
            }
            HubCommand::Whisper { from, to, text } => {
                self.handle_whisper(from, to, text);
            }
            HubCommand::List { reply } => {
                let _ = reply.send(self.clients.keys().cloned().collect());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    sessions: self.clients.len(),
                    ..self.stats
                });
            }
            HubCommand::Leave { id, name } => {
                self.handle_leave(id, name);
            }
            HubCommand::Shutdown => {
                info!("Shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_join(&mut self, name: String, session: SessionHandle) -> JoinOutcome {
        if self.clients.contains_key(&name) {
            warn!(session = %session.id, name = %name, "Name already in use");
            return JoinOutcome::NameTaken;
        }

        let id = session.id;
        let names: Vec<&str> = self
            .clients
            .keys()
            .map(String::as_str)
            .chain(iter::once(name.as_str()))
            .collect();
        let roster = format!("{} clients: {}", names.len(), names.join(", "));

        // The roster goes out before registering, so a joiner that cannot
        // take it is never announced
        let mut mailbox = Mailbox::new(session);
        let delivery = mailbox.push(roster, Instant::now(), &self.back_pressure);
        if account(&mut self.stats, &name, id, delivery) {
            mailbox.kick();
            self.stats.slow_disconnects += 1;
            warn!(session = %id, name = %name, "Roster not deliverable, dropping joiner");
            return JoinOutcome::Overloaded;
        }

        self.clients.insert(name.clone(), mailbox);
        self.stats.total_joined += 1;
        info!(session = %id, name = %name, "Client joined");

        self.fan_out(format!("{} has arrived", name), Some(id));
        debug!("Total clients: {}", self.clients.len());

        JoinOutcome::Joined
    }

    fn handle_whisper(&mut self, from: String, to: String, text: String) {
        if !self.clients.contains_key(&to) {
            debug!(from = %from, to = %to, "Whisper to unknown client ignored");
            return;
        }
        self.send_to(&from, format!("To {} : {}", to, text));
        self.send_to(&to, format!("from {} : {}", from, text));
    }

    fn handle_leave(&mut self, id: SessionId, name: String) {
        match self.clients.get(&name) {
            Some(mailbox) if mailbox.id() == id => {
                self.clients.remove(&name);
                info!(session = %id, name = %name, "Client left");
                self.fan_out(format!("{} has left", name), None);
                debug!("Total clients: {}", self.clients.len());
            }
            _ => debug!(session = %id, name = %name, "Stale leave ignored"),
        }
    }

    /// Deliver to one registered session, dropping it if it is stalled
    fn send_to(&mut self, name: &str, text: String) {
        let Some(mailbox) = self.clients.get_mut(name) else {
            return;
        };
        let id = mailbox.id();
        let delivery = mailbox.push(text, Instant::now(), &self.back_pressure);
        if account(&mut self.stats, name, id, delivery) {
            self.drop_stalled(vec![name.to_string()]);
        }
    }

    /// Deliver `text` to every registered session except `except`
    ///
    /// Departures caused by stalled sessions are queued behind the current
    /// message so the registry is never mutated while it is being iterated.
    fn fan_out(&mut self, text: String, except: Option<SessionId>) {
        let mut pending = VecDeque::from([(text, except)]);

        while let Some((text, except)) = pending.pop_front() {
            self.stats.messages_broadcast += 1;
            let now = Instant::now();
            let mut stalled = Vec::new();

            for (name, mailbox) in self.clients.iter_mut() {
                let id = mailbox.id();
                if Some(id) == except {
                    continue;
                }
                let delivery = mailbox.push(text.clone(), now, &self.back_pressure);
                if account(&mut self.stats, name, id, delivery) {
                    stalled.push(name.clone());
                }
            }

            for name in stalled {
                if let Some(left) = self.evict(&name) {
                    pending.push_back((format!("{} has left", left), None));
                }
            }
        }
    }

    fn has_backlog(&self) -> bool {
        self.clients.values().any(Mailbox::has_backlog)
    }

    /// Retry every backlogged mailbox and drop sessions that stopped draining
    fn flush_backlogs(&mut self) {
        let now = Instant::now();
        let mut stalled = Vec::new();

        for (name, mailbox) in self.clients.iter_mut() {
            if !mailbox.has_backlog() {
                continue;
            }
            mailbox.flush(now);
            let delivery = mailbox.enforce(now, &self.back_pressure);
            if account(&mut self.stats, name, mailbox.id(), delivery) {
                stalled.push(name.clone());
            }
        }

        if !stalled.is_empty() {
            self.drop_stalled(stalled);
        }
    }

    /// Evict each named session and announce its departure
    fn drop_stalled(&mut self, names: Vec<String>) {
        for name in names {
            if let Some(left) = self.evict(&name) {
                self.fan_out(format!("{} has left", left), None);
            }
        }
    }

    /// Deregister and force-disconnect a stalled session
    fn evict(&mut self, name: &str) -> Option<String> {
        let mailbox = self.clients.remove(name)?;
        mailbox.kick();
        self.stats.slow_disconnects += 1;
        warn!(session = %mailbox.id(), name = %name, "Client not draining its queue, disconnecting");
        Some(name.to_string())
    }

    /// Terminal transition: stop accepting, force-disconnect everyone,
    /// close the command channel.
    fn stop(&mut self) {
        self.shutdown.cancel();

        for (name, mailbox) in self.clients.drain() {
            debug!(session = %mailbox.id(), name = %name, "Forcing disconnect");
            mailbox.kick();
        }

        self.receiver.close();
    }
}

/// Record a delivery in the counters; true when the session must be dropped
fn account(stats: &mut HubStats, name: &str, id: SessionId, delivery: Delivery) -> bool {
    match delivery {
        Delivery::Accepted => false,
        Delivery::DroppedOldest(n) => {
            stats.dropped_messages += n as u64;
            warn!(session = %id, name = %name, dropped = n, "Backlog full, oldest lines dropped");
            false
        }
        Delivery::Stalled => true,
    }
}
