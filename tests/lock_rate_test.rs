// ============================================================================
// Lock + Rate Limiter Tests
// ============================================================================
//
// Concurrency properties of the shared-store primitives. The in-process
// store runs everywhere; the Redis variants need a live server:
//
//   REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
//
// ============================================================================

use serial_test::serial;
use sms_dispatch::store::{MemoryStore, RedisStore, SharedStore};
use sms_dispatch::{DistributedRateLimiter, MessageLock};
use std::sync::Arc;
use std::time::Duration;

use test_utils::redis_url;

const LOCK_TTL: Duration = Duration::from_secs(30);

fn unique_prefix(kind: &str) -> String {
    format!("test:{}:{}:", kind, uuid::Uuid::new_v4().simple())
}

async fn contended_lock(store: Arc<dyn SharedStore>, contenders: usize) -> Vec<String> {
    let lock = Arc::new(MessageLock::new(store, unique_prefix("lock")));
    let mut handles = Vec::with_capacity(contenders);

    for i in 0..contenders {
        let lock = Arc::clone(&lock);
        handles.push(tokio::spawn(async move {
            let holder = format!("worker-{}", i);
            lock.acquire("msg-contended", &holder, LOCK_TTL)
                .await
                .unwrap()
                .then_some(holder)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(holder) = handle.await.unwrap() {
            winners.push(holder);
        }
    }

    assert_eq!(lock.holder("msg-contended").await.unwrap().as_ref(), winners.first());
    lock.release("msg-contended").await.unwrap();
    winners
}

async fn contended_limiter(store: Arc<dyn SharedStore>, requests: usize, limit: u32) -> usize {
    let limiter = Arc::new(DistributedRateLimiter::new(
        store,
        unique_prefix("rate"),
        Duration::from_secs(60),
    ));
    // Fixed timestamp: every request lands in the same window
    let now_ms = 1_700_000_000_000;

    let mut handles = Vec::with_capacity(requests);
    for _ in 0..requests {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.allow_at("mno:Robi", limit, now_ms).await.unwrap()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_has_single_winner() {
    let winners = contended_lock(Arc::new(MemoryStore::new()), 64).await;
    assert_eq!(winners.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_respect_ceiling() {
    let allowed = contended_limiter(Arc::new(MemoryStore::new()), 100, 25).await;
    assert_eq!(allowed, 25);
}

#[tokio::test]
async fn test_lock_is_reacquirable_after_release() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let lock = MessageLock::new(store, "lock:");

    assert!(lock.acquire("m1", "a", LOCK_TTL).await.unwrap());
    assert!(!lock.acquire("m1", "b", LOCK_TTL).await.unwrap());
    lock.release("m1").await.unwrap();
    assert!(lock.acquire("m1", "b", LOCK_TTL).await.unwrap());
    assert_eq!(lock.holder("m1").await.unwrap().as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_lock_lapses() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let lock = MessageLock::new(store, "lock:");

    assert!(lock.acquire("m1", "crashed-worker", Duration::from_secs(5)).await.unwrap());
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(lock.acquire("m1", "survivor", LOCK_TTL).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
#[serial]
async fn test_redis_lock_has_single_winner() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let winners = contended_lock(Arc::new(store), 32).await;
    assert_eq!(winners.len(), 1);
}

#[tokio::test]
#[ignore] // Requires Redis
#[serial]
async fn test_redis_rate_limit_ceiling() {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    let allowed = contended_limiter(Arc::new(store), 60, 15).await;
    assert_eq!(allowed, 15);
}

#[tokio::test]
#[ignore] // Requires Redis
#[serial]
async fn test_redis_rate_window_expires() {
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&redis_url()).await.unwrap());
    let prefix = unique_prefix("rate");
    let limiter = DistributedRateLimiter::new(Arc::clone(&store), prefix.clone(), Duration::from_millis(200));

    let now_ms = chrono::Utc::now().timestamp_millis();
    assert!(limiter.allow_at("global", 1, now_ms).await.unwrap());
    assert!(!limiter.allow_at("global", 1, now_ms).await.unwrap());

    let key = limiter.key_for("global", limiter.window_index(now_ms));
    assert!(store.get(&key).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.get(&key).await.unwrap().is_none());
}
