// ============================================================================
// Dispatch Worker
// ============================================================================
//
// - carrier.rs   - carrier submission seam + simulated gateway
// - dlq.rs       - redelivery counter and dead-letter publishing
// - processor.rs - handling of a single broker delivery
// - consumer.rs  - bounded worker pool, resubscription, graceful shutdown
// - stats.rs     - per-instance outcome counters
//
// ============================================================================

pub mod carrier;
pub mod consumer;
pub mod dlq;
pub mod processor;
pub mod stats;

pub use carrier::{CarrierGateway, CarrierOutcome, SimulatedCarrier};
pub use consumer::ConsumptionLoop;
pub use dlq::{dead_letter_queue, DeadLetterGuard, DeadLetterMessage, RedeliveryVerdict};
pub use processor::{process_delivery, Disposition};
pub use stats::{spawn_stats_logger, StatsSnapshot, WorkerStats};

use dispatch_config::constants::{DEFAULT_LOCK_TTL_SECS, DEFAULT_MAX_REDELIVERIES};
use dispatch_config::{Config, RateLimitConfig, RedisKeyPrefixes};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::PriorityPublisher;
use crate::classifier::CarrierClassifier;
use crate::lock::MessageLock;
use crate::rate_limit::{DistributedRateLimiter, RatePolicy};
use crate::store::SharedStore;
use crate::telemetry::TelemetryRecorder;

/// Per-instance settings the processor needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub instance_id: String,
    pub queue: String,
    pub lock_ttl: Duration,
    pub max_redeliveries: u32,
    pub key_prefixes: RedisKeyPrefixes,
    pub rate_limit: RateLimitConfig,
}

impl WorkerSettings {
    pub fn new(instance_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            queue: queue.into(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            key_prefixes: RedisKeyPrefixes::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.worker.instance_id.clone(),
            queue: config.broker.queue.clone(),
            lock_ttl: Duration::from_secs(config.worker.lock_ttl_secs),
            max_redeliveries: config.worker.max_redeliveries,
            key_prefixes: config.redis.key_prefixes.clone(),
            rate_limit: config.rate_limit.clone(),
        }
    }
}

/// Everything a worker task touches, shared across the pool.
pub struct WorkerContext {
    pub instance_id: String,
    pub queue: String,
    pub lock: MessageLock,
    pub lock_ttl: Duration,
    pub classifier: CarrierClassifier,
    pub limiter: DistributedRateLimiter,
    pub policy: RatePolicy,
    pub dead_letters: DeadLetterGuard,
    pub publisher: PriorityPublisher,
    pub carrier: Arc<dyn CarrierGateway>,
    pub telemetry: Arc<TelemetryRecorder>,
    pub stats: Arc<WorkerStats>,
}

impl WorkerContext {
    pub fn new(
        settings: WorkerSettings,
        store: Arc<dyn SharedStore>,
        publisher: PriorityPublisher,
        carrier: Arc<dyn CarrierGateway>,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Self {
        let prefixes = &settings.key_prefixes;
        let window = Duration::from_millis(settings.rate_limit.window_ms.max(1));

        Self {
            lock: MessageLock::new(Arc::clone(&store), prefixes.lock.clone()),
            limiter: DistributedRateLimiter::new(Arc::clone(&store), prefixes.rate.clone(), window),
            dead_letters: DeadLetterGuard::new(store, prefixes.retry.clone(), settings.max_redeliveries),
            policy: RatePolicy::from_config(&settings.rate_limit),
            classifier: CarrierClassifier::new(),
            lock_ttl: settings.lock_ttl,
            instance_id: settings.instance_id,
            queue: settings.queue,
            publisher,
            carrier,
            telemetry,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// Stable consumer identity, reused on every resubscription.
    pub fn consumer_tag(&self) -> String {
        format!("sms-consumer-{}", self.instance_id)
    }
}
