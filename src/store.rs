use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("value for key `{0}` is not an integer")]
    NotAnInteger(String),
}

/// Shared counter store consumed by the rate limiter and the reference
/// token backend: byte-string values with TTL, atomic increment/decrement.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;
    /// Attach a fresh TTL to an existing key. Returns false if the key is
    /// absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Remaining TTL, `None` if the key is absent or has no expiry left.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// In-process store used by the binary and the tests. Expired entries are
/// dropped lazily on access; per-key operations are atomic because the map
/// shard stays locked for the whole entry mutation.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment/decrement shared path. The counter value is stored as its
    /// decimal text rendering, matching what `get` hands back.
    fn add_signed(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut slot = self.entries.entry(key.to_string()).or_insert(Entry {
            value: b"0".to_vec(),
            expires_at: None,
        });

        if slot.is_expired() {
            slot.value = b"0".to_vec();
            slot.expires_at = None;
        }

        let current = parse_counter(key, &slot.value)?;
        let next = current + delta;
        slot.value = next.to_string().into_bytes();
        Ok(next)
    }

    fn live_entry(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.live_entry(key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.add_signed(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.add_signed(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self.live_entry(key).and_then(|entry| {
            entry
                .expires_at
                .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_entry(key).is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }
}

fn parse_counter(key: &str, value: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{CounterStore, MemoryStore};
    use std::time::Duration;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("session", b"payload".to_vec(), None)
            .await
            .expect("set should succeed");

        let value = store.get("session").await.expect("get should succeed");
        assert_eq!(value.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn incr_starts_at_one_and_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("hits").await.expect("incr"), 1);
        assert_eq!(store.incr("hits").await.expect("incr"), 2);
        assert_eq!(store.decr("hits").await.expect("decr"), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let store = MemoryStore::new();
        store
            .set("short", b"1".to_vec(), Some(Duration::from_millis(20)))
            .await
            .expect("set should succeed");
        assert!(store.exists("short").await.expect("exists"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("short").await.expect("exists"));
        assert_eq!(store.get("short").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expire_refreshes_live_keys_only() {
        let store = MemoryStore::new();
        assert!(
            !store
                .expire("missing", Duration::from_secs(1))
                .await
                .expect("expire")
        );

        store
            .set("live", b"1".to_vec(), None)
            .await
            .expect("set should succeed");
        assert!(
            store
                .expire("live", Duration::from_secs(5))
                .await
                .expect("expire")
        );
        let ttl = store.ttl("live").await.expect("ttl").expect("ttl present");
        assert!(ttl <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn del_reports_prior_existence() {
        let store = MemoryStore::new();
        store
            .set("gone", b"1".to_vec(), None)
            .await
            .expect("set should succeed");
        assert!(store.del("gone").await.expect("del"));
        assert!(!store.del("gone").await.expect("del"));
    }
}
