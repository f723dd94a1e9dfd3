//! State of the one attached IRC client.
//!
//! A [`Session`] owns the client's identity, the set of channels the client
//! has been told it is in, and the outbound line queue. Output goes through
//! an unbounded queue drained by the connection's writer task, so lines keep
//! the order of the calls that produced them and writes never block.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cabal_store::Message as LogMessage;
use tokio::sync::{Notify, mpsc};

/// Where a session is in the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for USER.
    Unauthenticated,
    /// USER received; welcome and MOTD are being sent.
    Handshake,
    /// Registered. Every command dispatches.
    Ready,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub nick: String,
    pub username: String,
    pub realname: String,
}

pub struct Session {
    pub id: u64,
    /// Remote address, for logs.
    pub connection_id: String,
    identity: Mutex<Identity>,
    user_set: AtomicBool,
    phase: Mutex<Phase>,
    joined: Mutex<Vec<String>>,
    join_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Taken on close so the writer task sees the end of the queue.
    lines: Mutex<Option<mpsc::UnboundedSender<String>>>,
    echoes: mpsc::UnboundedSender<LogMessage>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Receiving ends handed to the connection that owns the transport.
pub struct SessionIo {
    /// Formatted lines (CRLF included) for the writer task.
    pub lines: mpsc::UnboundedReceiver<String>,
    /// Live log entries for the echo worker.
    pub echoes: mpsc::UnboundedReceiver<LogMessage>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(connection_id: String, nick: String) -> (Arc<Self>, SessionIo) {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (echo_tx, echo_rx) = mpsc::unbounded_channel();
        let session = Session {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            connection_id,
            identity: Mutex::new(Identity {
                username: nick.clone(),
                realname: nick.clone(),
                nick,
            }),
            user_set: AtomicBool::new(false),
            phase: Mutex::new(Phase::Unauthenticated),
            joined: Mutex::new(Vec::new()),
            join_locks: Mutex::new(HashMap::new()),
            lines: Mutex::new(Some(lines_tx)),
            echoes: echo_tx,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        };
        let io = SessionIo {
            lines: lines_rx,
            echoes: echo_rx,
        };
        (Arc::new(session), io)
    }

    // ── Identity ───────────────────────────────────────────────────────

    pub fn nick(&self) -> String {
        lock(&self.identity).nick.clone()
    }

    pub fn set_nick(&self, nick: &str) {
        lock(&self.identity).nick = nick.to_string();
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    /// Record username and realname. Only the first call has any effect.
    pub fn set_user(&self, username: &str, realname: &str) -> bool {
        if self.user_set.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut identity = lock(&self.identity);
        identity.username = username.to_string();
        identity.realname = realname.to_string();
        true
    }

    /// `nick!user@host` for lines the client originates.
    pub fn hostmask(&self, host: &str) -> String {
        let identity = lock(&self.identity);
        format!("{}!{}@{host}", identity.nick, identity.username)
    }

    // ── Phase ──────────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    // ── Joined channels ────────────────────────────────────────────────

    pub fn is_joined(&self, channel: &str) -> bool {
        lock(&self.joined).iter().any(|c| c == channel)
    }

    /// Add a channel to the join set. Returns false if it was already there.
    pub fn mark_joined(&self, channel: &str) -> bool {
        let mut joined = lock(&self.joined);
        if joined.iter().any(|c| c == channel) {
            return false;
        }
        joined.push(channel.to_string());
        true
    }

    pub fn mark_parted(&self, channel: &str) -> bool {
        let mut joined = lock(&self.joined);
        let before = joined.len();
        joined.retain(|c| c != channel);
        joined.len() != before
    }

    pub fn joined_channels(&self) -> Vec<String> {
        lock(&self.joined).clone()
    }

    /// Lock serializing join sequences for one channel.
    pub fn join_lock(&self, channel: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.join_locks);
        Arc::clone(
            locks
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    // ── Transport ──────────────────────────────────────────────────────

    /// Queue one line for the client. A no-op once the session is closed.
    pub fn send(&self, line: impl Display) {
        if self.is_closed() {
            return;
        }
        if let Some(lines) = lock(&self.lines).as_ref() {
            let _ = lines.send(format!("{line}\r\n"));
        }
    }

    /// Hand a live log entry to the echo worker.
    pub fn enqueue_echo(&self, msg: LogMessage) {
        if self.is_closed() {
            return;
        }
        let _ = self.echoes.send(msg);
    }

    /// Tear the session down: further writes are dropped, the join set is
    /// cleared and the connection loop is told to stop. Lines already queued
    /// stay in the queue for the writer task to flush.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.lines).take();
        lock(&self.joined).clear();
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[test]
    fn join_set_has_no_duplicates() {
        let (session, _io) = Session::new("test".into(), "alice".into());
        assert!(session.mark_joined("general"));
        assert!(!session.mark_joined("general"));
        assert!(session.mark_joined("dev"));
        assert_eq!(session.joined_channels(), vec!["general", "dev"]);
        assert!(session.mark_parted("general"));
        assert!(!session.mark_parted("general"));
        assert_eq!(session.joined_channels(), vec!["dev"]);
    }

    #[test]
    fn user_is_set_once() {
        let (session, _io) = Session::new("test".into(), "alice".into());
        assert!(session.set_user("al", "Alice"));
        assert!(!session.set_user("mallory", "Mallory"));
        let identity = session.identity();
        assert_eq!(identity.username, "al");
        assert_eq!(identity.realname, "Alice");
        assert_eq!(session.hostmask("gw"), "alice!al@gw");
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let (session, mut io) = Session::new("test".into(), "alice".into());
        session.mark_joined("general");
        session.send("one");
        session.close();
        session.send("two");

        assert_eq!(io.lines.try_recv().unwrap(), "one\r\n");
        assert_eq!(io.lines.try_recv(), Err(TryRecvError::Disconnected));
        assert!(session.joined_channels().is_empty());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (session, _io) = Session::new("test".into(), "alice".into());
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn join_lock_is_shared_per_channel() {
        let (session, _io) = Session::new("test".into(), "alice".into());
        let a = session.join_lock("general");
        let b = session.join_lock("general");
        let c = session.join_lock("dev");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
