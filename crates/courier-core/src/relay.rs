//! The relay engine: connection lifecycle and deliver-vs-queue routing.
//!
//! One task per connection drives the per-connection state machine
//! `CONNECTING -> ONLINE -> CLOSED` through [`Relay::handle_connection`].
//! Shared state is the presence registry plus the injected stores; every
//! touch of it is a short critical section inside those components.

use crate::message::{Message, Outgoing, SendRequest};
use crate::presence::{ClientHandle, PresenceRegistry};
use crate::store::{MessageStore, StatsLedger, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Inbound payload failed to parse into a send request.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Receiver identity missing from the payload.
    #[error("receiver identity is empty")]
    EmptyReceiver,

    /// Inbound content exceeds the configured limit.
    #[error("content exceeds {0} bytes")]
    ContentTooLarge(usize),

    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum inbound content size in bytes.
    pub max_content_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 64 * 1024,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Receiver was online; the message was pushed to its channel.
    Delivered,
    /// Receiver was offline; the message is held for backlog replay.
    Queued,
}

impl Outcome {
    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Queued => "queued",
        }
    }
}

/// Counters for one completed session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Backlog messages replayed at connect time.
    pub replayed: usize,
    /// Attempts that reached an online receiver.
    pub delivered: u64,
    /// Attempts queued for an offline receiver.
    pub queued: u64,
    /// Events dropped or failed without closing the connection.
    pub failed: u64,
}

/// Inbound side of one connection.
///
/// The transport layer adapts its socket into this; the relay only needs
/// "next payload or closed".
#[async_trait]
pub trait Inbound: Send {
    /// Next raw payload from the peer. `None` once the connection closed.
    async fn recv(&mut self) -> Option<String>;
}

/// The relay engine.
///
/// Owns the presence registry and orchestrates the injected stores. All
/// methods are `&self`; one `Relay` is shared across every connection task.
pub struct Relay {
    presence: PresenceRegistry,
    messages: Arc<dyn MessageStore>,
    stats: Arc<dyn StatsLedger>,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(messages: Arc<dyn MessageStore>, stats: Arc<dyn StatsLedger>) -> Self {
        Self::with_config(messages, stats, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(
        messages: Arc<dyn MessageStore>,
        stats: Arc<dyn StatsLedger>,
        config: RelayConfig,
    ) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            presence: PresenceRegistry::new(),
            messages,
            stats,
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// CONNECTING -> ONLINE.
    ///
    /// Ensures the stats record, registers presence (last connect wins), and
    /// replays the backlog into the new channel with `receive_status` forced
    /// true. Returns the number of replayed messages.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable; the connect is
    /// rejected and no presence entry is left behind.
    pub async fn connect(&self, identity: &str, handle: ClientHandle) -> Result<usize, RelayError> {
        // A failing store rejects the connect before any presence entry
        // exists, so a degraded backend never strands half-open sessions.
        self.stats.ensure_entry(identity).await?;

        self.presence.register(identity, handle.clone());

        let backlog = match self.messages.backlog_for(identity).await {
            Ok(backlog) => backlog,
            Err(e) => {
                self.presence.unregister_session(identity, handle.session());
                return Err(e.into());
            }
        };

        let mut replayed = 0;
        for message in &backlog {
            if !handle.push(Outgoing::Message(message.replay_view())) {
                break;
            }
            replayed += 1;
        }

        info!(identity, replayed, "connection online");
        Ok(replayed)
    }

    /// ONLINE self-loop: process one inbound payload.
    ///
    /// Parses the payload, persists the message unconditionally, pushes it
    /// to the receiver's channel when online, and records both stats
    /// counters. Stats reflect attempts, not confirmed deliveries.
    ///
    /// # Errors
    ///
    /// Every error is scoped to this one event; the connection stays up.
    pub async fn dispatch(&self, sender: &str, payload: &str) -> Result<Outcome, RelayError> {
        let request: SendRequest = serde_json::from_str(payload)?;
        if request.receiver.is_empty() {
            return Err(RelayError::EmptyReceiver);
        }
        if request.content.len() > self.config.max_content_bytes {
            return Err(RelayError::ContentTooLarge(self.config.max_content_bytes));
        }

        let recipient = self.presence.lookup(&request.receiver);
        let message = Message::new(sender, request.receiver, request.content, recipient.is_some());

        // Persist before the live push: once append succeeds the attempt is
        // durable no matter what the receiver's channel does.
        self.messages.append(&message).await?;

        let outcome = match recipient {
            Some(handle) => {
                if !handle.push(Outgoing::Message(message.clone())) {
                    // Receiver closed between lookup and push; the record is
                    // already durable and replay hands it over on reconnect.
                    debug!(sender, receiver = %message.receiver, "receiver channel closed mid-send");
                }
                Outcome::Delivered
            }
            None => Outcome::Queued,
        };

        self.stats.record_sent(sender, &message.receiver).await?;
        self.stats.record_received(&message.receiver, sender).await?;

        debug!(sender, receiver = %message.receiver, outcome = outcome.as_str(), "relayed");
        Ok(outcome)
    }

    /// ONLINE -> CLOSED.
    ///
    /// Session-scoped: a stale connection overwritten by a reconnect cannot
    /// evict its replacement.
    pub fn disconnect(&self, identity: &str, session: u64) {
        if self.presence.unregister_session(identity, session) {
            info!(identity, "connection closed");
        }
    }

    /// Run the full connection state machine over an inbound stream.
    ///
    /// Entry point for the transport layer: registers the connection,
    /// replays backlog, processes inbound payloads until the stream closes,
    /// then unregisters. Per-event failures are contained to the event that
    /// caused them; only a connect-time failure returns an error.
    pub async fn handle_connection<I: Inbound>(
        &self,
        identity: &str,
        handle: ClientHandle,
        mut inbound: I,
    ) -> Result<SessionSummary, RelayError> {
        let session = handle.session();
        let reply = handle.clone();

        let mut summary = SessionSummary {
            replayed: self.connect(identity, handle).await?,
            ..SessionSummary::default()
        };

        while let Some(payload) = inbound.recv().await {
            match self.dispatch(identity, &payload).await {
                Ok(Outcome::Delivered) => summary.delivered += 1,
                Ok(Outcome::Queued) => summary.queued += 1,
                Err(RelayError::Store(e)) => {
                    // Fatal for this attempt only: tell the sender, keep the
                    // connection.
                    error!(identity, error = %e, "relay attempt failed");
                    reply.push(Outgoing::Error {
                        error: format!("message not relayed: {e}"),
                    });
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(identity, error = %e, "dropping inbound event");
                    summary.failed += 1;
                }
            }
        }

        self.disconnect(identity, session);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn new_relay() -> (Relay, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Relay::new(store.clone(), store.clone()), store)
    }

    fn payload(receiver: &str, content: &str) -> String {
        serde_json::json!({"receiver": receiver, "content": content}).to_string()
    }

    fn recv_message(rx: &mut UnboundedReceiver<Outgoing>) -> Message {
        match rx.try_recv().expect("expected a frame") {
            Outgoing::Message(message) => message,
            Outgoing::Error { error } => panic!("unexpected error frame: {error}"),
        }
    }

    struct Script(std::vec::IntoIter<String>);

    impl Script {
        fn new(payloads: Vec<String>) -> Self {
            Self(payloads.into_iter())
        }
    }

    #[async_trait]
    impl Inbound for Script {
        async fn recv(&mut self) -> Option<String> {
            self.0.next()
        }
    }

    #[tokio::test]
    async fn test_connect_creates_stats_eagerly() {
        let (relay, store) = new_relay();
        let (handle, _rx) = ClientHandle::channel();

        let replayed = relay.connect("alice", handle).await.unwrap();
        assert_eq!(replayed, 0);
        assert!(relay.presence().is_online("alice"));

        let stats = store.get("alice").await.unwrap();
        assert!(stats.chats.is_empty());
    }

    #[tokio::test]
    async fn test_live_delivery_is_also_persisted() {
        let (relay, store) = new_relay();
        let (alice, _alice_rx) = ClientHandle::channel();
        let (bob, mut bob_rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();
        relay.connect("bob", bob).await.unwrap();

        let outcome = relay.dispatch("alice", &payload("bob", "hi")).await.unwrap();
        assert_eq!(outcome, Outcome::Delivered);

        let received = recv_message(&mut bob_rx);
        assert_eq!(received.sender, "alice");
        assert_eq!(received.receiver, "bob");
        assert_eq!(received.content, "hi");
        assert!(received.delivered);

        // Total recall: the live message is in the store too
        let backlog = store.backlog_for("bob").await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].delivered);
    }

    #[tokio::test]
    async fn test_offline_queue_then_replay_reports_delivered() {
        let (relay, store) = new_relay();
        let (alice, _alice_rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();

        let outcome = relay
            .dispatch("alice", &payload("carol", "are you there?"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Queued);

        // Stored with delivered=false
        let stored = store.backlog_for("carol").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].delivered);

        // Carol connects later: replay reports delivered=true
        let (carol, mut carol_rx) = ClientHandle::channel();
        let replayed = relay.connect("carol", carol).await.unwrap();
        assert_eq!(replayed, 1);

        let replay = recv_message(&mut carol_rx);
        assert_eq!(replay.content, "are you there?");
        assert!(replay.delivered);

        // The stored record keeps its original flag
        let stored = store.backlog_for("carol").await.unwrap();
        assert!(!stored[0].delivered);
    }

    #[tokio::test]
    async fn test_last_connect_wins_delivery() {
        let (relay, _store) = new_relay();
        let (first, mut first_rx) = ClientHandle::channel();
        let (second, mut second_rx) = ClientHandle::channel();
        relay.connect("bob", first).await.unwrap();
        relay.connect("bob", second).await.unwrap();

        let (alice, _alice_rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();
        relay.dispatch("alice", &payload("bob", "which one?")).await.unwrap();

        assert_eq!(recv_message(&mut second_rx).content, "which one?");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_replacement_online() {
        let (relay, _store) = new_relay();
        let (first, _rx1) = ClientHandle::channel();
        let (second, _rx2) = ClientHandle::channel();
        let stale = first.session();

        relay.connect("bob", first).await.unwrap();
        relay.connect("bob", second).await.unwrap();

        relay.disconnect("bob", stale);
        assert!(relay.presence().is_online("bob"));
    }

    #[tokio::test]
    async fn test_stats_count_attempts_regardless_of_outcome() {
        let (relay, store) = new_relay();
        let (alice, _alice_rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();

        // Two queued attempts while bob is offline
        relay.dispatch("alice", &payload("bob", "one")).await.unwrap();
        relay.dispatch("alice", &payload("bob", "two")).await.unwrap();

        // One delivered attempt once bob is online
        let (bob, _bob_rx) = ClientHandle::channel();
        relay.connect("bob", bob).await.unwrap();
        relay.dispatch("alice", &payload("bob", "three")).await.unwrap();

        let alice_stats = store.get("alice").await.unwrap();
        assert_eq!(alice_stats.chats.len(), 1);
        assert_eq!(alice_stats.chats[0].chat_username, "bob");
        assert_eq!(alice_stats.chats[0].messages_sent, 3);
        assert_eq!(alice_stats.chats[0].messages_received, 0);

        let bob_stats = store.get("bob").await.unwrap();
        assert_eq!(bob_stats.chats[0].chat_username, "alice");
        assert_eq!(bob_stats.chats[0].messages_received, 3);
        assert_eq!(bob_stats.chats[0].messages_sent, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_event_only() {
        let (relay, store) = new_relay();
        let (alice, _rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();

        assert!(matches!(
            relay.dispatch("alice", "not json").await,
            Err(RelayError::MalformedPayload(_))
        ));
        assert!(matches!(
            relay.dispatch("alice", r#"{"receiver": "", "content": "x"}"#).await,
            Err(RelayError::EmptyReceiver)
        ));

        // Nothing persisted, connection still usable
        assert!(store.backlog_for("alice").await.unwrap().is_empty());
        assert!(relay.presence().is_online("alice"));
        relay.dispatch("alice", &payload("bob", "fine")).await.unwrap();
    }

    #[tokio::test]
    async fn test_content_limit() {
        let store = Arc::new(MemoryStore::new());
        let relay = Relay::with_config(
            store.clone(),
            store.clone(),
            RelayConfig {
                max_content_bytes: 8,
            },
        );
        let (alice, _rx) = ClientHandle::channel();
        relay.connect("alice", alice).await.unwrap();

        assert!(matches!(
            relay.dispatch("alice", &payload("bob", "way past the limit")).await,
            Err(RelayError::ContentTooLarge(8))
        ));
        assert!(relay.dispatch("alice", &payload("bob", "ok")).await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_connection_full_session() {
        let (relay, store) = new_relay();
        let (handle, _rx) = ClientHandle::channel();

        let inbound = Script::new(vec![
            payload("bob", "first"),
            "garbage".to_string(),
            payload("bob", "second"),
        ]);

        let summary = relay
            .handle_connection("alice", handle, inbound)
            .await
            .unwrap();

        assert_eq!(summary.replayed, 0);
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 1);

        // Stream ended: alice is offline, both messages durable
        assert!(!relay.presence().is_online("alice"));
        let backlog = store.backlog_for("bob").await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].content, "first");
        assert_eq!(backlog[1].content, "second");
    }
}
