//! Store contracts consumed by the relay engine and the route layer.
//!
//! The engine is written against these traits and receives concrete
//! implementations by injection, so tests run on in-memory fakes and the
//! server runs on SQLite. Nothing in the engine assumes a particular
//! database beyond key-indexed find-or-create and append.

use crate::message::Message;
use crate::stats::UserStats;
use async_trait::async_trait;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No record for the requested key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage backend failed.
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Durable record of messages between users.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably persist one message. Failures must propagate; a silent drop
    /// is never acceptable.
    async fn append(&self, message: &Message) -> Result<(), StoreError>;

    /// Every stored message where `identity` is sender or receiver, ordered
    /// by timestamp with insertion order breaking ties.
    async fn backlog_for(&self, identity: &str) -> Result<Vec<Message>, StoreError>;
}

/// Per-user aggregate of messages sent and received per correspondent.
///
/// Updates for a given owner serialize relative to each other, preserving
/// the one-entry-per-correspondent invariant under concurrency.
#[async_trait]
pub trait StatsLedger: Send + Sync {
    /// Create an empty record for `owner` if none exists. Idempotent.
    async fn ensure_entry(&self, owner: &str) -> Result<(), StoreError>;

    /// Atomically increment `owner`'s messages_sent counter for
    /// `correspondent`, creating the counter entry if absent.
    async fn record_sent(&self, owner: &str, correspondent: &str) -> Result<(), StoreError>;

    /// Atomically increment `owner`'s messages_received counter for
    /// `correspondent`, creating the counter entry if absent.
    async fn record_received(&self, owner: &str, correspondent: &str) -> Result<(), StoreError>;

    /// The owner's record. `NotFound` when the owner has no record at all;
    /// an existing record with an empty chats list is not an error.
    async fn get(&self, owner: &str) -> Result<UserStats, StoreError>;
}

/// Registered user accounts, separate from live presence.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Register a new identity. `AlreadyExists` when it is taken.
    async fn create_user(&self, identity: &str) -> Result<(), StoreError>;

    /// Whether the identity has been registered.
    async fn exists(&self, identity: &str) -> Result<bool, StoreError>;
}
