//! # courier-core
//!
//! Presence tracking, message routing, and store contracts for the Courier
//! direct-messaging relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **PresenceRegistry** - who currently holds an open outbound channel
//! - **Relay** - connect/disconnect lifecycle and deliver-vs-queue routing
//! - **Message** / **UserStats** - domain and wire types
//! - **store** - contracts for durable storage, implemented by `courier-store`
//! - **MemoryStore** - in-memory store for tests and ephemeral runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  Connection │────▶│    Relay    │────▶│ PresenceRegistry │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!                            │
//!                            ▼
//!                    ┌───────────────┐
//!                    │ MessageStore  │
//!                    │ StatsLedger   │
//!                    └───────────────┘
//! ```

pub mod memory;
pub mod message;
pub mod presence;
pub mod relay;
pub mod stats;
pub mod store;

pub use memory::MemoryStore;
pub use message::{Message, Outgoing, SendRequest};
pub use presence::{ClientHandle, PresenceRegistry};
pub use relay::{Inbound, Outcome, Relay, RelayConfig, RelayError, SessionSummary};
pub use stats::{ChatCounter, UserStats};
pub use store::{MessageStore, StatsLedger, StoreError, UserDirectory};
