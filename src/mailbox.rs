//! Per-session delivery buffer owned by the hub
//!
//! Wraps a session's outbound queue with an ordered backlog. The hub never
//! waits on a queue: lines that do not fit are kept in the backlog and
//! flushed, oldest first, whenever the hub next touches the session.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;

use crate::config::{BackPressure, OverflowPolicy};
use crate::hub::SessionHandle;
use crate::types::SessionId;

/// Result of handing a line to a [`Mailbox`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued or buffered
    Accepted,
    /// Buffered after discarding this many of the oldest lines
    DroppedOldest(usize),
    /// The session cannot keep up and must be disconnected
    Stalled,
}

/// A registered session as seen by the hub
#[derive(Debug)]
pub struct Mailbox {
    handle: SessionHandle,
    backlog: VecDeque<String>,
    /// When the backlog last started waiting without progress
    waiting_since: Option<Instant>,
}

impl Mailbox {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            backlog: VecDeque::new(),
            waiting_since: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Raise the session's forced-disconnect signal
    pub fn kick(&self) {
        self.handle.kick.cancel();
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Append `text` behind anything already buffered and apply `limits`
    pub fn push(&mut self, text: String, now: Instant, limits: &BackPressure) -> Delivery {
        self.backlog.push_back(text);
        self.flush(now);
        self.enforce(now, limits)
    }

    /// Move as much of the backlog as fits into the outbound queue
    pub fn flush(&mut self, now: Instant) {
        let mut progressed = false;

        while let Some(line) = self.backlog.pop_front() {
            match self.handle.outbound.try_send(line) {
                Ok(()) => progressed = true,
                Err(TrySendError::Full(line)) => {
                    self.backlog.push_front(line);
                    break;
                }
                // Writer gone; the session is already on its way out
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    break;
                }
            }
        }

        if self.backlog.is_empty() {
            self.waiting_since = None;
        } else if progressed || self.waiting_since.is_none() {
            self.waiting_since = Some(now);
        }
    }

    /// Apply the overflow policy to the current backlog
    pub fn enforce(&mut self, now: Instant, limits: &BackPressure) -> Delivery {
        match limits.policy {
            OverflowPolicy::Disconnect => {
                let overfull = self.backlog.len() > limits.backlog_limit;
                let stalled = self
                    .waiting_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= limits.stall_timeout);
                if overfull || stalled {
                    Delivery::Stalled
                } else {
                    Delivery::Accepted
                }
            }
            OverflowPolicy::DropOldest => {
                let excess = self.backlog.len().saturating_sub(limits.backlog_limit);
                if excess == 0 {
                    return Delivery::Accepted;
                }
                self.backlog.drain(..excess);
                if self.backlog.is_empty() {
                    self.waiting_since = None;
                }
                Delivery::DroppedOldest(excess)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn mailbox(capacity: usize) -> (Mailbox, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = SessionHandle {
            id: SessionId::new(),
            outbound: tx,
            kick: CancellationToken::new(),
        };
        (Mailbox::new(handle), rx)
    }

    fn limits(policy: OverflowPolicy, backlog_limit: usize) -> BackPressure {
        BackPressure {
            policy,
            backlog_limit,
            stall_timeout: Duration::from_secs(5),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_full_queue_buffers_in_order() {
        let (mut mb, mut rx) = mailbox(2);
        let limits = limits(OverflowPolicy::Disconnect, 16);
        let now = Instant::now();

        for i in 0..5 {
            assert_eq!(mb.push(format!("m{}", i), now, &limits), Delivery::Accepted);
        }
        assert!(mb.has_backlog());
        assert_eq!(drain(&mut rx), vec!["m0", "m1"]);

        mb.flush(now);
        assert_eq!(drain(&mut rx), vec!["m2", "m3"]);
        mb.flush(now);
        assert_eq!(drain(&mut rx), vec!["m4"]);
        assert!(!mb.has_backlog());
    }

    #[test]
    fn test_new_lines_wait_behind_backlog() {
        let (mut mb, mut rx) = mailbox(1);
        let limits = limits(OverflowPolicy::Disconnect, 16);
        let now = Instant::now();

        mb.push("a".to_string(), now, &limits);
        mb.push("b".to_string(), now, &limits);
        assert_eq!(drain(&mut rx), vec!["a"]);

        // Room in the queue again, but "b" must still go first
        mb.push("c".to_string(), now, &limits);
        assert_eq!(drain(&mut rx), vec!["b"]);
        mb.flush(now);
        assert_eq!(drain(&mut rx), vec!["c"]);
    }

    #[test]
    fn test_backlog_limit_disconnects() {
        let (mut mb, _rx) = mailbox(1);
        let limits = limits(OverflowPolicy::Disconnect, 2);
        let now = Instant::now();

        assert_eq!(mb.push("a".into(), now, &limits), Delivery::Accepted);
        assert_eq!(mb.push("b".into(), now, &limits), Delivery::Accepted);
        assert_eq!(mb.push("c".into(), now, &limits), Delivery::Accepted);
        assert_eq!(mb.push("d".into(), now, &limits), Delivery::Stalled);
    }

    #[test]
    fn test_stall_needs_no_progress_for_timeout() {
        let (mut mb, mut rx) = mailbox(1);
        let limits = limits(OverflowPolicy::Disconnect, 100);
        let t0 = Instant::now();

        mb.push("a".into(), t0, &limits);
        mb.push("b".into(), t0, &limits);
        assert_eq!(mb.enforce(t0 + Duration::from_secs(4), &limits), Delivery::Accepted);

        // Draining one line restarts the clock
        drain(&mut rx);
        let t1 = t0 + Duration::from_secs(4);
        mb.flush(t1);
        mb.push("c".into(), t1, &limits);
        assert_eq!(mb.enforce(t1 + Duration::from_secs(4), &limits), Delivery::Accepted);
        assert_eq!(mb.enforce(t1 + Duration::from_secs(5), &limits), Delivery::Stalled);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let (mut mb, mut rx) = mailbox(1);
        let limits = limits(OverflowPolicy::DropOldest, 2);
        let now = Instant::now();

        mb.push("m0".into(), now, &limits);
        mb.push("m1".into(), now, &limits);
        mb.push("m2".into(), now, &limits);
        assert_eq!(mb.push("m3".into(), now, &limits), Delivery::DroppedOldest(1));
        assert_eq!(mb.push("m4".into(), now, &limits), Delivery::DroppedOldest(1));

        assert_eq!(drain(&mut rx), vec!["m0"]);
        mb.flush(now);
        assert_eq!(drain(&mut rx), vec!["m3"]);
        mb.flush(now);
        assert_eq!(drain(&mut rx), vec!["m4"]);
    }

    #[test]
    fn test_closed_queue_discards_backlog() {
        let (mut mb, rx) = mailbox(1);
        let limits = limits(OverflowPolicy::Disconnect, 4);
        let now = Instant::now();

        mb.push("a".into(), now, &limits);
        mb.push("b".into(), now, &limits);
        drop(rx);

        assert_eq!(mb.push("c".into(), now, &limits), Delivery::Accepted);
        assert!(!mb.has_backlog());
    }
}
