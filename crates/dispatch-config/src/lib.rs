// ============================================================================
// Configuration
// ============================================================================
//
// All settings come from the environment (optionally seeded from a .env file).
// Each section loads itself; `Config::from_env` only composes them and fails
// fast on values the pipeline cannot run with.
//
// ============================================================================

mod broker;
pub mod constants;
mod rate_limit;
mod redis;
mod telemetry;
mod worker;

use anyhow::{Context, Result};

pub use broker::{parse_url_list, BrokerConfig};
pub use rate_limit::{parse_mno_limits, RateLimitConfig, RateLimitStrategy};
pub use redis::{RedisConfig, RedisKeyPrefixes};
pub use telemetry::TelemetryConfig;
pub use worker::WorkerConfig;

use constants::DEFAULT_METRICS_PORT;

#[derive(Clone, Debug)]
pub struct Config {
    pub broker: BrokerConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub worker: WorkerConfig,
    pub telemetry: TelemetryConfig,
    /// Port for the /health and /metrics endpoint
    pub metrics_port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let broker = BrokerConfig::from_env().context("Invalid broker configuration")?;
        let redis = RedisConfig::from_env();
        let rate_limit = RateLimitConfig::from_env().context("Invalid rate limit configuration")?;
        let worker = WorkerConfig::from_env().context("Invalid worker configuration")?;
        let telemetry = TelemetryConfig::from_env().context("Invalid telemetry configuration")?;

        Ok(Self {
            broker,
            redis,
            rate_limit,
            worker,
            telemetry,
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_METRICS_PORT),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Broker section only, for tools that never consume (stats, load generator).
    pub fn broker_from_env() -> Result<BrokerConfig> {
        dotenvy::dotenv().ok();
        BrokerConfig::from_env()
    }

    /// Telemetry section only.
    pub fn telemetry_from_env() -> Result<TelemetryConfig> {
        dotenvy::dotenv().ok();
        TelemetryConfig::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RABBITMQ_URLS",
        "INSTANCE_ID",
        "TELEMETRY_ENABLED",
        "RATE_LIMIT_STRATEGY",
        "MNO_TPS_LIMITS",
        "MAX_WORKERS",
        "CARRIER_FAILURE_RATE",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear();
        std::env::set_var("RABBITMQ_URLS", "amqp://a:5672,amqp://b:5672");
        std::env::set_var("INSTANCE_ID", "worker-1");
        std::env::set_var("TELEMETRY_ENABLED", "false");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.broker.urls.len(), 2);
        assert_eq!(cfg.broker.queue, "general");
        assert_eq!(cfg.broker.prefetch_count, 500);
        assert_eq!(cfg.worker.max_workers, 200);
        assert_eq!(cfg.worker.lock_ttl_secs, 30);
        assert_eq!(cfg.rate_limit.strategy, RateLimitStrategy::PerOperator);
        assert_eq!(cfg.rate_limit.window_ms, 1000);
        assert_eq!(cfg.telemetry.batch_size, 5000);
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_instance_id() {
        clear();
        std::env::set_var("RABBITMQ_URLS", "amqp://a:5672");
        std::env::set_var("TELEMETRY_ENABLED", "false");

        assert!(Config::from_env().is_err());
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_influx_settings_when_enabled() {
        clear();
        std::env::set_var("RABBITMQ_URLS", "amqp://a:5672");
        std::env::set_var("INSTANCE_ID", "worker-1");
        std::env::set_var("TELEMETRY_ENABLED", "true");
        std::env::remove_var("INFLUXDB_URL");

        assert!(Config::from_env().is_err());
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_failure_rate() {
        clear();
        std::env::set_var("RABBITMQ_URLS", "amqp://a:5672");
        std::env::set_var("INSTANCE_ID", "worker-1");
        std::env::set_var("TELEMETRY_ENABLED", "false");
        std::env::set_var("CARRIER_FAILURE_RATE", "1.5");

        assert!(Config::from_env().is_err());
        clear();
    }
}
