use super::{expiry_from_ttl, unix_millis_now, KvStore, StoredValue};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Process-local store. Expired entries are dropped lazily on read and by
/// the periodic cleanup task.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_expired(stored: &StoredValue, now_ms: i64) -> bool {
    stored
        .expires_at_ms
        .is_some_and(|expires| expires <= now_ms)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = unix_millis_now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if is_expired(stored, now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: expiry_from_ttl(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = unix_millis_now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, stored| !is_expired(stored, now));
        Ok(before.saturating_sub(entries.len()))
    }
}
