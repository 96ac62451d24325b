// ============================================================================
// Distributed Fixed-Window Rate Limiter
// ============================================================================
//
// Key: {rate prefix}{scope}:{window index}, window index = floor(now / window)
//
// INCR then, on the first increment only, PEXPIRE with the window length.
// A request is allowed iff the post-increment count is <= the ceiling. INCR
// is atomic in the store, so concurrent instances never undercount.
//
// The INCR and the PEXPIRE are two round trips. If the process dies between
// them the key lives without a TTL; it is never read again because the next
// window uses a different key.
//
// ============================================================================

use dispatch_config::{RateLimitConfig, RateLimitStrategy};
use dispatch_error::StoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::store::SharedStore;
use crate::types::Operator;

pub const GLOBAL_SCOPE: &str = "global";

pub struct DistributedRateLimiter {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    window: Duration,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, window: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            window: window.max(Duration::from_millis(1)),
        }
    }

    /// Count one request against `scope` in the current window.
    pub async fn allow(&self, scope: &str, limit: u32) -> Result<bool, StoreError> {
        self.allow_at(scope, limit, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Same as [`allow`](Self::allow) with an explicit wall-clock time (ms since epoch).
    pub async fn allow_at(&self, scope: &str, limit: u32, now_ms: i64) -> Result<bool, StoreError> {
        let key = self.key_for(scope, self.window_index(now_ms));

        let count = self.store.incr(&key).await?;
        if count == 1 {
            if let Err(e) = self.store.expire(&key, self.window).await {
                // Counter still applies to this window; only cleanup is lost
                warn!(key = %key, error = %e, "Failed to set rate window expiry");
            }
        }

        let allowed = count <= i64::from(limit);
        trace!(scope = scope, count = count, limit = limit, allowed = allowed, "Rate limit evaluated");
        Ok(allowed)
    }

    pub fn window_index(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.window.as_millis() as i64)
    }

    pub fn key_for(&self, scope: &str, window_index: i64) -> String {
        format!("{}{}:{}", self.key_prefix, scope, window_index)
    }
}

/// Resolves which scope and ceiling a message is counted against.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    strategy: RateLimitStrategy,
    global_tps: u32,
    mno_tps: HashMap<Operator, u32>,
    default_mno_tps: u32,
}

impl RatePolicy {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        let mut mno_tps = HashMap::new();
        for (name, tps) in &cfg.mno_limits {
            match name.parse::<Operator>() {
                Ok(op) => {
                    mno_tps.insert(op, *tps);
                }
                Err(_) => warn!(mno = %name, "Ignoring TPS ceiling for unknown operator"),
            }
        }

        Self {
            strategy: cfg.strategy,
            global_tps: cfg.global_tps,
            mno_tps,
            default_mno_tps: cfg.default_mno_tps,
        }
    }

    pub fn global(tps: u32) -> Self {
        Self {
            strategy: RateLimitStrategy::Global,
            global_tps: tps,
            mno_tps: HashMap::new(),
            default_mno_tps: tps,
        }
    }

    pub fn per_operator(limits: impl IntoIterator<Item = (Operator, u32)>, default_tps: u32) -> Self {
        Self {
            strategy: RateLimitStrategy::PerOperator,
            global_tps: default_tps,
            mno_tps: limits.into_iter().collect(),
            default_mno_tps: default_tps,
        }
    }

    /// `(scope, ceiling)` for a message routed to `operator`.
    pub fn scope_for(&self, operator: Operator) -> (String, u32) {
        match self.strategy {
            RateLimitStrategy::Global => (GLOBAL_SCOPE.to_string(), self.global_tps),
            RateLimitStrategy::PerOperator => (
                format!("mno:{}", operator.as_str()),
                self.mno_tps
                    .get(&operator)
                    .copied()
                    .unwrap_or(self.default_mno_tps),
            ),
        }
    }
}
