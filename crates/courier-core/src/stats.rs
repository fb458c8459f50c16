//! Per-user delivery statistics.
//!
//! Counters track relay *attempts*, not confirmed deliveries, and are only
//! ever incremented.

use serde::{Deserialize, Serialize};

/// Counters for one correspondent.
///
/// An entry may exist with only one side populated; the other stays zero
/// until the first interaction in that direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCounter {
    /// The other party in the conversation.
    pub chat_username: String,
    /// Messages this record's owner has sent to the correspondent.
    pub messages_sent: u64,
    /// Messages this record's owner has received from the correspondent.
    pub messages_received: u64,
}

/// Aggregate record for one user.
///
/// `chats` is ordered by first interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub username: String,
    pub chats: Vec<ChatCounter>,
}

impl UserStats {
    /// Empty record for a user with no interactions yet.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            chats: Vec::new(),
        }
    }
}

/// Which counter a stats update applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Increment-or-insert on an ordered counter list.
///
/// The check and the insert form one critical section: callers must hold
/// whatever lock guards the list for the whole call, which is what keeps
/// concurrent updates from racing to create duplicate correspondent entries.
pub fn bump(chats: &mut Vec<ChatCounter>, correspondent: &str, direction: Direction) {
    if let Some(counter) = chats
        .iter_mut()
        .find(|c| c.chat_username == correspondent)
    {
        match direction {
            Direction::Sent => counter.messages_sent += 1,
            Direction::Received => counter.messages_received += 1,
        }
        return;
    }

    let mut counter = ChatCounter {
        chat_username: correspondent.to_string(),
        ..ChatCounter::default()
    };
    match direction {
        Direction::Sent => counter.messages_sent = 1,
        Direction::Received => counter.messages_received = 1,
    }
    chats.push(counter);
}
