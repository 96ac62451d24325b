// ============================================================================
// Telemetry Configuration
// ============================================================================

use anyhow::{bail, Result};

use crate::constants::{DEFAULT_TELEMETRY_BATCH_SIZE, DEFAULT_TELEMETRY_FLUSH_INTERVAL_MS};

/// InfluxDB v2 write target
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// false = points are dropped (no time-series store configured)
    pub enabled: bool,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl TelemetryConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let cfg = Self {
            enabled: std::env::var("TELEMETRY_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            url: std::env::var("INFLUXDB_URL").unwrap_or_default(),
            token: std::env::var("INFLUXDB_TOKEN").unwrap_or_default(),
            org: std::env::var("INFLUXDB_ORG").unwrap_or_default(),
            bucket: std::env::var("INFLUXDB_BUCKET").unwrap_or_default(),
            batch_size: std::env::var("TELEMETRY_BATCH_SIZE")
                .unwrap_or_else(|_| DEFAULT_TELEMETRY_BATCH_SIZE.to_string())
                .parse()
                .unwrap_or(DEFAULT_TELEMETRY_BATCH_SIZE),
            flush_interval_ms: std::env::var("TELEMETRY_FLUSH_INTERVAL_MS")
                .unwrap_or_else(|_| DEFAULT_TELEMETRY_FLUSH_INTERVAL_MS.to_string())
                .parse()
                .unwrap_or(DEFAULT_TELEMETRY_FLUSH_INTERVAL_MS),
        };

        if cfg.enabled {
            for (name, value) in [
                ("INFLUXDB_URL", &cfg.url),
                ("INFLUXDB_TOKEN", &cfg.token),
                ("INFLUXDB_ORG", &cfg.org),
                ("INFLUXDB_BUCKET", &cfg.bucket),
            ] {
                if value.is_empty() {
                    bail!("{} is required when TELEMETRY_ENABLED=true", name);
                }
            }
        }
        if cfg.batch_size == 0 || cfg.flush_interval_ms == 0 {
            bail!("TELEMETRY_BATCH_SIZE and TELEMETRY_FLUSH_INTERVAL_MS must be greater than zero");
        }

        Ok(cfg)
    }
}
