//! Message types for the relay.
//!
//! The wire shape is plain JSON. The `delivered` flag travels under the
//! `receive_status` key for compatibility with existing clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A relayed direct message.
///
/// `delivered` is fixed at creation time: true if and only if the receiver
/// was online at the moment the sender's event was processed. Stored records
/// are never mutated afterward; backlog replay presents its own view (see
/// [`Message::replay_view`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the sending user.
    pub sender: String,
    /// Identity of the receiving user.
    pub receiver: String,
    /// Textual content.
    pub content: String,
    /// Wall-clock creation time, serialized as an ISO-8601 string.
    pub timestamp: DateTime<Utc>,
    /// Whether the receiver was reachable when this message was sent.
    #[serde(rename = "receive_status")]
    pub delivered: bool,
}

impl Message {
    /// Create a message stamped with the current wall-clock time.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
        delivered: bool,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
            timestamp: Utc::now(),
            delivered,
        }
    }

    /// Copy of this message as backlog replay reports it: always delivered.
    ///
    /// Only the view handed to a (re)connecting client is forced true; the
    /// stored record keeps its original flag for audit.
    #[must_use]
    pub fn replay_view(&self) -> Self {
        Self {
            delivered: true,
            ..self.clone()
        }
    }
}

/// Inbound send request from a client.
///
/// Clients may echo the full wire shape back; anything beyond `receiver` and
/// `content` is ignored. `sender` and `timestamp` are always assigned by the
/// relay from the connection's identity and the server clock.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Identity of the intended receiver.
    pub receiver: String,
    /// Textual content.
    pub content: String,
}

/// Frames pushed to a connection's outbound queue.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    /// A relayed or replayed message.
    Message(Message),
    /// A per-event failure surfaced to the sender.
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = Message::new("alice", "bob", "hi", true);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["sender"], "alice");
        assert_eq!(json["receiver"], "bob");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["receive_status"], true);
        assert!(json.get("delivered").is_none());

        // Timestamp must round-trip as an ISO-8601 string
        let ts = json["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_replay_view_forces_delivered() {
        let msg = Message::new("alice", "carol", "queued", false);
        let view = msg.replay_view();

        assert!(view.delivered);
        assert!(!msg.delivered); // original untouched
        assert_eq!(view.content, msg.content);
    }

    #[test]
    fn test_send_request_ignores_extra_fields() {
        // A client echoing the full wire shape still parses
        let payload = r#"{
            "sender": "spoofed",
            "receiver": "bob",
            "content": "hi",
            "timestamp": "2024-01-01T00:00:00Z",
            "receive_status": true
        }"#;

        let req: SendRequest = serde_json::from_str(payload).unwrap();
        assert_eq!(req.receiver, "bob");
        assert_eq!(req.content, "hi");
    }

    #[test]
    fn test_send_request_rejects_missing_fields() {
        assert!(serde_json::from_str::<SendRequest>(r#"{"receiver": "bob"}"#).is_err());
        assert!(serde_json::from_str::<SendRequest>("not json").is_err());
    }

    #[test]
    fn test_outgoing_error_shape() {
        let frame = Outgoing::Error {
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json, serde_json::json!({"error": "boom"}));
    }
}
