//! SQLite storage for messages, stats, and user accounts.
//!
//! One connection guarded by an async mutex; every statement runs as a
//! short critical section, which also serializes stats updates for a given
//! owner. Counter updates use an upsert so increment-or-create is a single
//! atomic statement rather than a check-then-act sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::message::Message;
use courier_core::stats::{ChatCounter, UserStats};
use courier_core::store::{MessageStore, StatsLedger, StoreError, UserDirectory};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    sender    TEXT NOT NULL,
    receiver  TEXT NOT NULL,
    content   TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver);

CREATE TABLE IF NOT EXISTS stats_owners (
    username TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS chat_stats (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    owner             TEXT NOT NULL,
    correspondent     TEXT NOT NULL,
    messages_sent     INTEGER NOT NULL DEFAULT 0,
    messages_received INTEGER NOT NULL DEFAULT 0,
    UNIQUE (owner, correspondent)
);
"#;

/// Durable store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        info!(path = %path.display(), "sqlite store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private scratch database. Used by tests and `:memory:` configs.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let timestamp: String = row.get(3)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(Message {
        sender: row.get(0)?,
        receiver: row.get(1)?,
        content: row.get(2)?,
        timestamp,
        delivered: row.get(4)?,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (sender, receiver, content, timestamp, delivered) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.sender,
                message.receiver,
                message.content,
                message.timestamp.to_rfc3339(),
                message.delivered,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn backlog_for(&self, identity: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT sender, receiver, content, timestamp, delivered FROM messages \
                 WHERE sender = ?1 OR receiver = ?1 ORDER BY timestamp, id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![identity], row_to_message)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }
}

#[async_trait]
impl StatsLedger for SqliteStore {
    async fn ensure_entry(&self, owner: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO stats_owners (username) VALUES (?1)",
            params![owner],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn record_sent(&self, owner: &str, correspondent: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        record(&conn, owner, correspondent, "messages_sent")
    }

    async fn record_received(&self, owner: &str, correspondent: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        record(&conn, owner, correspondent, "messages_received")
    }

    async fn get(&self, owner: &str) -> Result<UserStats, StoreError> {
        let conn = self.conn.lock().await;
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM stats_owners WHERE username = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        if known.is_none() {
            return Err(StoreError::NotFound(owner.to_string()));
        }

        let mut stmt = conn
            .prepare(
                "SELECT correspondent, messages_sent, messages_received FROM chat_stats \
                 WHERE owner = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let chats = stmt
            .query_map(params![owner], |row| {
                Ok(ChatCounter {
                    chat_username: row.get(0)?,
                    messages_sent: row.get(1)?,
                    messages_received: row.get(2)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        Ok(UserStats {
            username: owner.to_string(),
            chats,
        })
    }
}

/// Increment-or-create one counter column as a single upsert.
fn record(
    conn: &Connection,
    owner: &str,
    correspondent: &str,
    column: &str,
) -> Result<(), StoreError> {
    // Updates create the owner's record lazily
    conn.execute(
        "INSERT OR IGNORE INTO stats_owners (username) VALUES (?1)",
        params![owner],
    )
    .map_err(sql_err)?;

    // `column` is one of two literals above, never user input
    let sql = format!(
        "INSERT INTO chat_stats (owner, correspondent, {column}) VALUES (?1, ?2, 1) \
         ON CONFLICT (owner, correspondent) DO UPDATE SET {column} = {column} + 1"
    );
    conn.execute(&sql, params![owner, correspondent])
        .map_err(sql_err)?;
    Ok(())
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn create_user(&self, identity: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        match conn.execute(
            "INSERT INTO users (username) VALUES (?1)",
            params![identity],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(identity.to_string()))
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(row.is_some())
    }
}
