//! # courier-store
//!
//! Durable SQLite implementations of the `courier-core` store contracts:
//! the message log, the stats ledger, and the user directory all live in
//! one database file.

pub mod sqlite;

pub use sqlite::SqliteStore;
