//! Durable storage for guaranteed-delivery messages and batching state.
//!
//! Two tables, both keyed by message UUID: `MESSAGES` holds
//! guaranteed-delivery messages until the server acknowledges them,
//! `BATCH_BY` holds messages accumulated by the batching policy. Blobs are
//! the canonical wire JSON, so a restarted process reconstructs exactly
//! what it would have sent.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Connection, Row, SqliteConnection};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

use crate::message::Message;

pub struct MessagePersistence {
    runtime: Runtime,
    conn: Arc<Mutex<SqliteConnection>>,
}

impl MessagePersistence {
    /// Opens (or creates) the local database file.
    pub fn open(path: &Path) -> Result<MessagePersistence> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Unable to build tokio runtime for persistence")?;

        if !path.exists() {
            log::debug!("Creating a local database file at {path:?}");
            File::create(path).context("Unable to create the local database file")?;
        }

        let conn = runtime.block_on(async {
            let mut conn = SqliteConnection::connect(&path.as_os_str().to_string_lossy())
                .await
                .with_context(|| {
                    format!(
                        "Unable to connect to SQLite in file {path:?}. \
                        Make sure that the current process can read from the file and write to it, \
                        and that no other process accesses the file."
                    )
                })?;

            for statement in [
                "CREATE TABLE IF NOT EXISTS MESSAGES (
                    TIMESTAMP BIGINT NOT NULL,
                    UUID VARCHAR(40) PRIMARY KEY,
                    ENDPOINT_ID VARCHAR(100) NOT NULL,
                    MESSAGE BLOB
                )",
                "CREATE INDEX IF NOT EXISTS MESSAGES_ENDPOINT_ID ON MESSAGES (ENDPOINT_ID)",
                "CREATE TABLE IF NOT EXISTS BATCH_BY (
                    TIMESTAMP BIGINT NOT NULL,
                    ENDPOINT_ID VARCHAR(40) NOT NULL,
                    MESSAGE_ID VARCHAR(40) PRIMARY KEY,
                    MESSAGE BLOB
                )",
            ] {
                sqlx::query(statement)
                    .execute(&mut conn)
                    .await
                    .context("Unable to initialize the local database schema")?;
            }

            Ok::<_, anyhow::Error>(conn)
        })?;

        log::debug!("Connection to SQLite established");

        Ok(MessagePersistence {
            runtime,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // Guaranteed-delivery messages
    // ----------------------------------------------------------------

    pub fn save(&self, endpoint_id: &str, message: &Message) -> Result<()> {
        let blob = message
            .to_wire_json()
            .context("Unable to serialize message for persistence")?;
        let timestamp = Utc::now().timestamp_millis();

        self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            sqlx::query(
                "INSERT OR REPLACE INTO MESSAGES (TIMESTAMP, UUID, ENDPOINT_ID, MESSAGE) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(timestamp)
            .bind(message.client_id())
            .bind(endpoint_id)
            .bind(blob)
            .execute(&mut *conn)
            .await
            .context("Unable to persist message")?;
            Ok(())
        })
    }

    pub fn delete(&self, client_ids: &[String]) -> Result<()> {
        self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            for client_id in client_ids {
                sqlx::query("DELETE FROM MESSAGES WHERE UUID = ?")
                    .bind(client_id.as_str())
                    .execute(&mut *conn)
                    .await
                    .context("Unable to delete acknowledged message")?;
            }
            Ok(())
        })
    }

    /// All pending guaranteed-delivery messages of an endpoint, oldest
    /// first. Rows whose blob no longer parses are dropped from the store.
    pub fn load_all(&self, endpoint_id: &str) -> Result<Vec<Message>> {
        self.load_table("MESSAGES", "ENDPOINT_ID", endpoint_id)
    }

    pub fn pending_count(&self, endpoint_id: &str) -> Result<usize> {
        self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            let row = sqlx::query("SELECT COUNT(*) AS CNT FROM MESSAGES WHERE ENDPOINT_ID = ?")
                .bind(endpoint_id)
                .fetch_one(&mut *conn)
                .await
                .context("Unable to count persisted messages")?;
            Ok(row.get::<i64, _>("CNT") as usize)
        })
    }

    // batchBy policy state
    // ----------------------------------------------------------------

    pub fn save_batch_by(&self, endpoint_id: &str, message: &Message) -> Result<()> {
        let blob = message
            .to_wire_json()
            .context("Unable to serialize batched message")?;
        let timestamp = Utc::now().timestamp_millis();

        self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            sqlx::query(
                "INSERT OR REPLACE INTO BATCH_BY (TIMESTAMP, ENDPOINT_ID, MESSAGE_ID, MESSAGE) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(timestamp)
            .bind(endpoint_id)
            .bind(message.client_id())
            .bind(blob)
            .execute(&mut *conn)
            .await
            .context("Unable to persist batched message")?;
            Ok(())
        })
    }

    pub fn clear_batch_by(&self, endpoint_id: &str) -> Result<()> {
        self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            sqlx::query("DELETE FROM BATCH_BY WHERE ENDPOINT_ID = ?")
                .bind(endpoint_id)
                .execute(&mut *conn)
                .await
                .context("Unable to clear batched messages")?;
            Ok(())
        })
    }

    pub fn load_batch_by(&self, endpoint_id: &str) -> Result<Vec<Message>> {
        self.load_table("BATCH_BY", "ENDPOINT_ID", endpoint_id)
    }

    fn load_table(&self, table: &str, key_column: &str, key: &str) -> Result<Vec<Message>> {
        let rows = self.runtime.block_on(async {
            let mut conn = self.conn.lock().await;
            sqlx::query(&format!(
                "SELECT MESSAGE FROM {table} WHERE {key_column} = ? ORDER BY TIMESTAMP"
            ))
            .bind(key)
            .fetch_all(&mut *conn)
            .await
            .context("Unable to load persisted messages")
        })?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("MESSAGE");
            match Message::from_wire_json(&blob) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    log::warn!("Dropping a persisted message that no longer parses: {e}");
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{Priority, Reliability};

    fn message(n: i64) -> Message {
        Message::builder()
            .source("0-EP")
            .priority(Priority::Medium)
            .reliability(Reliability::GuaranteedDelivery)
            .format("urn:test")
            .data_item("n", n)
            .build_data()
            .unwrap()
    }

    #[test]
    fn save_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        let store = MessagePersistence::open(&path).unwrap();

        let first = message(1);
        let second = message(2);
        store.save("0-EP", &first).unwrap();
        store.save("0-EP", &second).unwrap();
        store.save("0-OTHER", &message(3)).unwrap();

        assert_eq!(store.pending_count("0-EP").unwrap(), 2);
        let loaded = store.load_all("0-EP").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].client_id(), first.client_id());

        store.delete(&[first.client_id().to_owned()]).unwrap();
        assert_eq!(store.pending_count("0-EP").unwrap(), 1);
        assert_eq!(store.pending_count("0-OTHER").unwrap(), 1);
    }

    #[test]
    fn persisted_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");

        let saved = message(7);
        {
            let store = MessagePersistence::open(&path).unwrap();
            store.save("0-EP", &saved).unwrap();
        }

        let store = MessagePersistence::open(&path).unwrap();
        let loaded = store.load_all("0-EP").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].client_id(), saved.client_id());
        assert_eq!(loaded[0].payload(), saved.payload());
    }

    #[test]
    fn batch_by_state_is_kept_separately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        let store = MessagePersistence::open(&path).unwrap();

        store.save_batch_by("0-EP", &message(1)).unwrap();
        store.save_batch_by("0-EP", &message(2)).unwrap();
        assert_eq!(store.load_batch_by("0-EP").unwrap().len(), 2);
        assert_eq!(store.pending_count("0-EP").unwrap(), 0);

        store.clear_batch_by("0-EP").unwrap();
        assert!(store.load_batch_by("0-EP").unwrap().is_empty());
    }
}
