//! Prometheus metrics for the SMS dispatch pipeline
//!
//! Provides centralized metrics collection for monitoring:
//! - Delivery outcomes and processing latency
//! - Broker connection health
//! - Publisher throughput
//! - Telemetry writes

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

// ============================================================================
// Delivery Metrics
// ============================================================================

/// Deliveries handled by the consumption loop, by outcome and operator
pub static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sms_dispatch_deliveries_total",
            "Broker deliveries handled by the consumption loop"
        ),
        &["outcome", "mno"]
    )
    .expect("Failed to register DELIVERIES_TOTAL metric")
});

/// Carrier submission latency in seconds
pub static PROCESSING_TIME_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sms_dispatch_processing_time_seconds",
        "Time from lock acquisition to carrier response",
        &["mno"],
        vec![0.01, 0.025, 0.05, 0.1, 0.15, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register PROCESSING_TIME_SECONDS metric")
});

/// Workers currently holding a semaphore permit
pub static WORKERS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "sms_dispatch_workers_in_flight",
        "Deliveries currently being processed"
    ))
    .expect("Failed to register WORKERS_IN_FLIGHT metric")
});

// ============================================================================
// Broker Metrics
// ============================================================================

/// Successful reconnects after a failure signal
pub static BROKER_RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "sms_dispatch_broker_reconnects_total",
        "Successful broker reconnects"
    ))
    .expect("Failed to register BROKER_RECONNECTS_TOTAL metric")
});

/// Current connection state (0=Disconnected, 1=Connecting, 2=Connected, 3=Reconnecting, 4=Closed)
pub static BROKER_CONNECTION_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "sms_dispatch_broker_connection_state",
        "Broker connection state"
    ))
    .expect("Failed to register BROKER_CONNECTION_STATE metric")
});

/// Publish attempts by queue and result
pub static PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("sms_dispatch_publish_total", "Publish attempts"),
        &["queue", "result"]
    )
    .expect("Failed to register PUBLISH_TOTAL metric")
});

/// Messages moved to a dead-letter queue
pub static DEAD_LETTERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "sms_dispatch_dead_lettered_total",
        "Messages moved to a dead-letter queue after repeated redelivery"
    ))
    .expect("Failed to register DEAD_LETTERED_TOTAL metric")
});

// ============================================================================
// Telemetry Metrics
// ============================================================================

pub static TELEMETRY_POINTS_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "sms_dispatch_telemetry_points_written_total",
        "Telemetry points accepted by the time-series store"
    ))
    .expect("Failed to register TELEMETRY_POINTS_WRITTEN metric")
});

pub static TELEMETRY_WRITE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "sms_dispatch_telemetry_write_failures_total",
        "Telemetry batch writes that failed"
    ))
    .expect("Failed to register TELEMETRY_WRITE_FAILURES metric")
});

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        DELIVERIES_TOTAL.with_label_values(&["delivered", "Robi"]).inc();
        BROKER_RECONNECTS_TOTAL.inc();

        let metrics_text = gather_metrics().unwrap();
        assert!(metrics_text.contains("sms_dispatch_deliveries_total"));
        assert!(metrics_text.contains("sms_dispatch_broker_reconnects_total"));
    }
}
