//! Key-value collaborator shared by every delivery of a message.
//!
//! Values are opaque strings with an optional TTL. There is no
//! compare-and-set: callers that gate on presence accept the race.

pub mod mailbox;
pub mod memory;
pub mod sqlite;

pub use mailbox::{AttemptRecord, ChatTurnRecord, Mailbox, MailboxTtl, UserKey};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{expand_path, StoreBackend, StoreConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time;

/// A stored value together with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    /// Unix milliseconds; `None` never expires.
    pub expires_at_ms: Option<i64>,
}

impl StoredValue {
    /// Lifetime left at `now_ms`, `None` for values without expiry.
    pub fn remaining(&self, now_ms: i64) -> Option<Duration> {
        self.expires_at_ms
            .map(|expires| Duration::from_millis(expires.saturating_sub(now_ms).max(0) as u64))
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn cleanup_expired(&self) -> Result<usize>;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_with_ttl(key).await?.map(|stored| stored.value))
    }

    /// Reads `key` and rewrites it with a fresh `ttl` once its remaining
    /// lifetime drops to `threshold` or below.
    async fn get_with_refresh(
        &self,
        key: &str,
        ttl: Duration,
        threshold: Duration,
    ) -> Result<Option<String>> {
        let Some(stored) = self.get_with_ttl(key).await? else {
            return Ok(None);
        };
        if let Some(remaining) = stored.remaining(unix_millis_now()) {
            if remaining <= threshold {
                self.set(key, &stored.value, Some(ttl)).await?;
            }
        }
        Ok(Some(stored.value))
    }
}

pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(expand_path(&config.path))?),
    };
    spawn_cleanup_task(
        Arc::clone(&store),
        Duration::from_secs(config.cleanup_interval_secs.max(1)),
    );
    Ok(store)
}

fn spawn_cleanup_task(store: Arc<dyn KvStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match store.cleanup_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!("kv cleanup removed {removed} expired entries"),
                Err(err) => tracing::warn!("kv cleanup failed: {err:#}"),
            }
        }
    });
}

pub(crate) fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

pub(crate) fn expiry_from_ttl(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| unix_millis_now().saturating_add(ttl.as_millis() as i64))
}
