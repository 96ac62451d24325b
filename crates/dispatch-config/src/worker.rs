// ============================================================================
// Worker Configuration
// ============================================================================

use anyhow::{bail, Result};

use crate::constants::*;

/// Consumption loop and carrier simulation settings
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Unique per running instance; used as lock holder, consumer tag and telemetry tag
    pub instance_id: String,
    pub max_workers: usize,
    pub lock_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Redeliveries tolerated before a poison message is dead-lettered (0 = never)
    pub max_redeliveries: u32,
    pub stats_log_interval_secs: u64,
    pub carrier_min_latency_ms: u64,
    pub carrier_max_latency_ms: u64,
    pub carrier_failure_rate: f64,
}

impl WorkerConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let instance_id = std::env::var("INSTANCE_ID").unwrap_or_default();
        if instance_id.trim().is_empty() {
            bail!("INSTANCE_ID must be set and unique per running instance");
        }

        let cfg = Self {
            instance_id: instance_id.trim().to_string(),
            max_workers: std::env::var("MAX_WORKERS")
                .unwrap_or_else(|_| DEFAULT_MAX_WORKERS.to_string())
                .parse()
                .unwrap_or(DEFAULT_MAX_WORKERS),
            lock_ttl_secs: std::env::var("LOCK_TTL_SECS")
                .unwrap_or_else(|_| DEFAULT_LOCK_TTL_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_LOCK_TTL_SECS),
            shutdown_grace_secs: std::env::var("SHUTDOWN_GRACE_SECS")
                .unwrap_or_else(|_| DEFAULT_SHUTDOWN_GRACE_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            max_redeliveries: std::env::var("MAX_REDELIVERIES")
                .unwrap_or_else(|_| DEFAULT_MAX_REDELIVERIES.to_string())
                .parse()
                .unwrap_or(DEFAULT_MAX_REDELIVERIES),
            stats_log_interval_secs: std::env::var("STATS_LOG_INTERVAL_SECS")
                .unwrap_or_else(|_| DEFAULT_STATS_LOG_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_STATS_LOG_INTERVAL_SECS),
            carrier_min_latency_ms: std::env::var("CARRIER_MIN_LATENCY_MS")
                .unwrap_or_else(|_| DEFAULT_CARRIER_MIN_LATENCY_MS.to_string())
                .parse()
                .unwrap_or(DEFAULT_CARRIER_MIN_LATENCY_MS),
            carrier_max_latency_ms: std::env::var("CARRIER_MAX_LATENCY_MS")
                .unwrap_or_else(|_| DEFAULT_CARRIER_MAX_LATENCY_MS.to_string())
                .parse()
                .unwrap_or(DEFAULT_CARRIER_MAX_LATENCY_MS),
            carrier_failure_rate: std::env::var("CARRIER_FAILURE_RATE")
                .unwrap_or_else(|_| DEFAULT_CARRIER_FAILURE_RATE.to_string())
                .parse()
                .unwrap_or(DEFAULT_CARRIER_FAILURE_RATE),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.carrier_failure_rate) {
            bail!("CARRIER_FAILURE_RATE must be within [0, 1]");
        }
        if self.carrier_min_latency_ms > self.carrier_max_latency_ms {
            bail!("CARRIER_MIN_LATENCY_MS must not exceed CARRIER_MAX_LATENCY_MS");
        }
        Ok(())
    }
}
