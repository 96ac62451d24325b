// ============================================================================
// Message Lock
// ============================================================================
//
// Idempotency claim per message id: SET {lock prefix}{msg_id} {holder} NX PX ttl
//
// Held from acquisition until the worker finishes (explicit DEL) or the TTL
// lapses. A delivery that cannot acquire the lock is a duplicate of one that
// is still being worked and goes back to the broker.
//
// Locks this instance holds are tracked, so a shutdown that aborts workers
// mid-flight can still release them instead of leaving them to the TTL.
//
// ============================================================================

use dispatch_error::StoreError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::store::SharedStore;

pub struct MessageLock {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    held: Mutex<HashSet<String>>,
}

impl MessageLock {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Atomic set-if-absent. `false` means another holder owns the message.
    pub async fn acquire(&self, msg_id: &str, holder_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let acquired = self.store.set_nx(&self.key(msg_id), holder_id, ttl).await?;
        if acquired {
            self.held_ids().insert(msg_id.to_string());
        }
        Ok(acquired)
    }

    pub async fn release(&self, msg_id: &str) -> Result<(), StoreError> {
        self.held_ids().remove(msg_id);
        self.store.del(&self.key(msg_id)).await?;
        Ok(())
    }

    /// Release every lock acquired here and not yet released. Returns how
    /// many were deleted.
    pub async fn release_all(&self) -> usize {
        let ids: Vec<String> = self.held_ids().drain().collect();
        let mut released = 0;
        for msg_id in ids {
            match self.store.del(&self.key(&msg_id)).await {
                Ok(_) => released += 1,
                Err(e) => warn!(msg_id = %msg_id, error = %e, "Failed to release message lock"),
            }
        }
        released
    }

    /// Number of locks acquired here and not yet released.
    pub fn held_count(&self) -> usize {
        self.held_ids().len()
    }

    /// Current holder, if the lock is live.
    pub async fn holder(&self, msg_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&self.key(msg_id)).await
    }

    fn held_ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key(&self, msg_id: &str) -> String {
        format!("{}{}", self.key_prefix, msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let lock = MessageLock::new(Arc::new(MemoryStore::new()), "lock:");

        assert!(lock.acquire("m1", "worker-a", TTL).await.unwrap());
        assert!(!lock.acquire("m1", "worker-b", TTL).await.unwrap());
        assert_eq!(lock.holder("m1").await.unwrap().as_deref(), Some("worker-a"));

        lock.release("m1").await.unwrap();
        assert!(lock.acquire("m1", "worker-b", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lapses_after_ttl() {
        let lock = MessageLock::new(Arc::new(MemoryStore::new()), "lock:");

        assert!(lock.acquire("m2", "worker-a", Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(lock.acquire("m2", "worker-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let lock = Arc::new(MessageLock::new(Arc::new(MemoryStore::new()), "lock:"));

        let mut handles = Vec::new();
        for i in 0..32 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire("m3", &format!("worker-{}", i), TTL).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_of_missing_lock_is_ok() {
        let lock = MessageLock::new(Arc::new(MemoryStore::new()), "lock:");
        assert!(lock.release("never-held").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_all_clears_held_locks() {
        let store = Arc::new(MemoryStore::new());
        let lock = MessageLock::new(store.clone(), "lock:");
        let other = MessageLock::new(store, "lock:");

        assert!(lock.acquire("a", "worker-a", TTL).await.unwrap());
        assert!(lock.acquire("b", "worker-a", TTL).await.unwrap());
        assert!(other.acquire("c", "worker-b", TTL).await.unwrap());
        assert!(!lock.acquire("c", "worker-a", TTL).await.unwrap());
        assert_eq!(lock.held_count(), 2);

        assert_eq!(lock.release_all().await, 2);
        assert_eq!(lock.held_count(), 0);
        assert_eq!(lock.holder("a").await.unwrap(), None);
        assert_eq!(lock.holder("b").await.unwrap(), None);
        // Someone else's lock is untouched
        assert_eq!(lock.holder("c").await.unwrap().as_deref(), Some("worker-b"));
    }
}
