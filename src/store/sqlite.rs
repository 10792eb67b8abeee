use super::{expiry_from_ttl, unix_millis_now, KvStore, StoredValue};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// SQLite-backed store, shareable between gateway processes on one host.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_kv_entries_expires_at
             ON kv_entries(expires_at);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let now = unix_millis_now();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let row = conn
                .query_row(
                    "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
                )
                .optional()?;

            match row {
                Some((_, Some(expires_at))) if expires_at <= now => {
                    conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                Some((value, expires_at_ms)) => Ok(Some(StoredValue {
                    value,
                    expires_at_ms,
                })),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = expiry_from_ttl(ttl);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO kv_entries(key, value, expires_at)
                 VALUES(?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await?
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.clone();
        let now = unix_millis_now();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let removed = conn.execute(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            Ok(removed)
        })
        .await?
    }
}
