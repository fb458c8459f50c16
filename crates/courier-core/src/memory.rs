//! In-memory store, for tests and ephemeral runs.
//!
//! Implements the same contracts as the SQLite store. Each structure has its
//! own lock so unrelated conversations do not serialize against each other.

use crate::message::Message;
use crate::stats::{bump, ChatCounter, Direction, UserStats};
use crate::store::{MessageStore, StatsLedger, StoreError, UserDirectory};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Volatile implementation of all three store contracts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<HashSet<String>>,
    messages: Mutex<Vec<Message>>,
    stats: Mutex<HashMap<String, Vec<ChatCounter>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("poisoned lock".to_string()))
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        locked(&self.messages)?.push(message.clone());
        Ok(())
    }

    async fn backlog_for(&self, identity: &str) -> Result<Vec<Message>, StoreError> {
        let messages = locked(&self.messages)?;
        let mut backlog: Vec<Message> = messages
            .iter()
            .filter(|m| m.sender == identity || m.receiver == identity)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        backlog.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(backlog)
    }
}

#[async_trait]
impl StatsLedger for MemoryStore {
    async fn ensure_entry(&self, owner: &str) -> Result<(), StoreError> {
        locked(&self.stats)?.entry(owner.to_string()).or_default();
        Ok(())
    }

    async fn record_sent(&self, owner: &str, correspondent: &str) -> Result<(), StoreError> {
        let mut stats = locked(&self.stats)?;
        let chats = stats.entry(owner.to_string()).or_default();
        bump(chats, correspondent, Direction::Sent);
        Ok(())
    }

    async fn record_received(&self, owner: &str, correspondent: &str) -> Result<(), StoreError> {
        let mut stats = locked(&self.stats)?;
        let chats = stats.entry(owner.to_string()).or_default();
        bump(chats, correspondent, Direction::Received);
        Ok(())
    }

    async fn get(&self, owner: &str) -> Result<UserStats, StoreError> {
        let stats = locked(&self.stats)?;
        match stats.get(owner) {
            Some(chats) => Ok(UserStats {
                username: owner.to_string(),
                chats: chats.clone(),
            }),
            None => Err(StoreError::NotFound(owner.to_string())),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn create_user(&self, identity: &str) -> Result<(), StoreError> {
        if !locked(&self.users)?.insert(identity.to_string()) {
            return Err(StoreError::AlreadyExists(identity.to_string()));
        }
        Ok(())
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(locked(&self.users)?.contains(identity))
    }
}
