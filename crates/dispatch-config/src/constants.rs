// ============================================================================
// Configuration Constants
// ============================================================================

// Broker
pub const DEFAULT_QUEUE_NAME: &str = "general";
pub(crate) const DEFAULT_PREFETCH_COUNT: u16 = 500;
pub(crate) const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
pub(crate) const DEFAULT_MANAGEMENT_URL: &str = "http://localhost:15672";

/// Highest priority a queue is declared with; publish priorities are clamped to it.
pub const MAX_PRIORITY: u8 = 4;

// Rate limiting
pub(crate) const DEFAULT_GLOBAL_TPS: u32 = 500;
pub(crate) const DEFAULT_MNO_TPS: u32 = 100;
// Ceilings are kept below each operator's advertised limit
pub(crate) const DEFAULT_MNO_TPS_LIMITS: &str = "GP=450,Robi=400,Airtel=180";
pub(crate) const DEFAULT_RATE_WINDOW_MS: u64 = 1000;

// Worker pool
pub(crate) const DEFAULT_MAX_WORKERS: usize = 200;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;
pub(crate) const DEFAULT_STATS_LOG_INTERVAL_SECS: u64 = 5;

// Simulated carrier
pub(crate) const DEFAULT_CARRIER_MIN_LATENCY_MS: u64 = 50;
pub(crate) const DEFAULT_CARRIER_MAX_LATENCY_MS: u64 = 150;
pub(crate) const DEFAULT_CARRIER_FAILURE_RATE: f64 = 0.05;

// Telemetry
pub(crate) const DEFAULT_TELEMETRY_BATCH_SIZE: usize = 5000;
pub(crate) const DEFAULT_TELEMETRY_FLUSH_INTERVAL_MS: u64 = 100;

// Process
pub(crate) const DEFAULT_METRICS_PORT: u16 = 9102;
