// ============================================================================
// Redis-backed SharedStore
// ============================================================================

use async_trait::async_trait;
use dispatch_error::StoreError;
use redis::aio::ConnectionManager;
use redis::{cmd, Cmd, FromRedisValue, RedisError};
use std::time::Duration;
use tracing::{info, warn};

use super::{ttl_millis, SharedStore};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Redis store over a multiplexed, auto-reconnecting connection.
///
/// `ConnectionManager` is cheap to clone and safe to use from many tasks at
/// once, so no client-side mutex is held around commands.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }

    /// Run a command, retrying with backoff only when the connection was
    /// refused. A refused command never reached the server, so retrying a
    /// non-idempotent INCR cannot double count.
    async fn query<T: FromRedisValue>(&self, op: &'static str, command: Cmd) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<T> = command.query_async(&mut conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_refusal() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        operation = op,
                        attempt = attempt,
                        error = %e,
                        "Redis connection refused, will retry"
                    );
                    let backoff = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }
}

fn store_err(e: RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut c = cmd("INCR");
        c.arg(key);
        self.query("incr", c).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut c = cmd("PEXPIRE");
        c.arg(key).arg(ttl_millis(ttl));
        let applied: i64 = self.query("expire", c).await?;
        Ok(applied == 1)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut c = cmd("SET");
        c.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        // Nil reply means the key already existed
        let reply: Option<String> = self.query("set_nx", c).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut c = cmd("DEL");
        c.arg(key);
        let removed: i64 = self.query("del", c).await?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut c = cmd("GET");
        c.arg(key);
        self.query("get", c).await
    }
}
