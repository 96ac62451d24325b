// ============================================================================
// In-process SharedStore
// ============================================================================
//
// Single-process stand-in for Redis used by tests and local runs. Every
// operation holds the map lock for its whole read-modify-write, which gives
// the same per-key atomicity Redis gives. Expiry uses tokio's clock so tests
// can drive it with `tokio::time::pause()`.
//
// ============================================================================

use async_trait::async_trait;
use dispatch_error::StoreError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{ttl_millis, SharedStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a live key; `None` for missing keys or keys without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.get(key).is_some_and(|e| e.is_live(now)))
            .unwrap_or(false)
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Run `f` under the map lock with `key` already purged if it has expired.
    fn with_entries<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_string()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        f(&mut entries, now)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_entries(key, |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            let next = entry
                .value
                .parse::<i64>()
                .map_err(|_| {
                    StoreError::UnexpectedReply(format!("value at {} is not an integer", key))
                })?
                + 1;
            entry.value = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + Duration::from_millis(ttl_millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, now| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + Duration::from_millis(ttl_millis(ttl))),
                },
            );
            Ok(true)
        })
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, _| Ok(entries.remove(key).is_some()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(key, |entries, _| Ok(entries.get(key).map(|e| e.value.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_creates_and_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.set_nx("lock:a", "w1", ttl).await.unwrap());
        assert!(!store.set_nx("lock:a", "w2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("w1"));
        assert!(store.del("lock:a").await.unwrap());
        assert!(store.set_nx("lock:a", "w2", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        store.incr("rate:x").await.unwrap();
        assert!(store.expire("rate:x", Duration::from_millis(500)).await.unwrap());
        assert!(store.ttl("rate:x").is_some());

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(!store.contains("rate:x"));
        assert_eq!(store.get("rate:x").await.unwrap(), None);
        assert!(!store.expire("rate:x", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.incr("k").await.is_err());
        store.set_unavailable(false);
        assert!(store.incr("k").await.is_ok());
    }
}
