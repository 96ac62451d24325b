// ============================================================================
// Shared Key-Value Store
// ============================================================================
//
// The lock, the rate limiter and the dead-letter guard only need a handful of
// single-key primitives. Every primitive must be atomic at the store itself;
// callers never layer client-side locking on top.
//
// ============================================================================

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use dispatch_error::StoreError;
use std::time::Duration;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// INCR: atomically increment, creating the key at 0 first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// PEXPIRE: set a time-to-live. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// SET key value NX PX ttl. Returns true if this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// DEL. Returns true if a key was removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Store TTLs are whole milliseconds; never round a non-zero TTL down to 0.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
