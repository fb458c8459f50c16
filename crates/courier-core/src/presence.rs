//! Presence registry: the authoritative map of who is reachable right now.
//!
//! Each online user has exactly one entry binding their identity to the
//! outbound channel of their most recent connection.

use crate::message::Outgoing;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Atomic counter distinguishing successive connections for one identity.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Handle to one connection's outbound queue.
///
/// Pushes never block: frames are buffered in an unbounded channel drained by
/// the connection's writer task, so two peers messaging each other at the
/// same time cannot deadlock.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    session: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ClientHandle {
    /// Wrap an outbound sender in a new handle.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            session: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Session identifier, unique per handle.
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Queue a frame for delivery.
    ///
    /// Returns `false` if the connection's writer has gone away.
    pub fn push(&self, frame: Outgoing) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Identity -> live connection mapping.
///
/// At most one entry per identity; registering again replaces the previous
/// binding (last connect wins). Safe under concurrent register, lookup, and
/// unregister from independent connection tasks.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online: DashMap<String, ClientHandle>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identity to a connection, replacing any prior binding.
    ///
    /// Overwrite is not an error: reconnecting under the same identity is
    /// an explicit last-wins policy.
    pub fn register(&self, identity: &str, handle: ClientHandle) {
        let replaced = self.online.insert(identity.to_string(), handle).is_some();
        debug!(identity, replaced, "presence: registered");
    }

    /// Remove the binding if present; no-op otherwise.
    pub fn unregister(&self, identity: &str) -> bool {
        let removed = self.online.remove(identity).is_some();
        if removed {
            debug!(identity, "presence: unregistered");
        }
        removed
    }

    /// Remove the binding only if `session` still owns it.
    ///
    /// A reconnect overwrites the old binding; when the stale connection
    /// finally closes it must not evict its replacement.
    pub fn unregister_session(&self, identity: &str, session: u64) -> bool {
        let removed = self
            .online
            .remove_if(identity, |_, handle| handle.session() == session)
            .is_some();
        if removed {
            debug!(identity, session, "presence: unregistered");
        }
        removed
    }

    /// Look up the live connection for an identity, if any.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<ClientHandle> {
        self.online.get(identity).map(|entry| entry.value().clone())
    }

    /// O(1) reachability check.
    #[must_use]
    pub fn is_online(&self, identity: &str) -> bool {
        self.online.contains_key(identity)
    }

    /// Number of currently online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}
