// ============================================================================
// Delivery Telemetry
// ============================================================================
//
// Append-only delivery events written to a time-series store. One message may
// produce several records over its lifetime: `queued` in sms_delivery, the
// carrier's delivered / failed verdict in final_sms_delivery, other consumer
// events in sms_events. Writes are best-effort: a failed write is logged and counted
// and never influences how a broker delivery is settled.
//
// ============================================================================

mod influx;
pub mod line_protocol;
mod recorder;

pub use influx::InfluxSink;
pub use recorder::TelemetryRecorder;

use async_trait::async_trait;
use dispatch_error::TelemetryError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::QueueMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    /// Publish-side lifecycle
    SmsDelivery,
    /// Terminal carrier outcome
    FinalSmsDelivery,
    /// Consumer-side processing events
    SmsEvents,
}

impl Measurement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::SmsDelivery => "sms_delivery",
            Measurement::FinalSmsDelivery => "final_sms_delivery",
            Measurement::SmsEvents => "sms_events",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    Failed,
    RateLimited,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::RateLimited => "rate_limited",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry point.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub measurement: Measurement,
    pub msg_id: String,
    pub mno: String,
    pub instance_id: String,
    pub status: DeliveryStatus,
    pub processing_time_ms: u64,
    pub retry_count: Option<u32>,
    /// Epoch ms at which the message entered the queue
    pub queue_time_ms: Option<i64>,
    /// Epoch ms
    pub timestamp_ms: i64,
}

impl DeliveryRecord {
    /// Consumer-side event (`sms_events`).
    pub fn event(
        msg_id: impl Into<String>,
        mno: impl Into<String>,
        instance_id: impl Into<String>,
        status: DeliveryStatus,
    ) -> Self {
        Self {
            measurement: Measurement::SmsEvents,
            msg_id: msg_id.into(),
            mno: mno.into(),
            instance_id: instance_id.into(),
            status,
            processing_time_ms: 0,
            retry_count: None,
            queue_time_ms: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Publish-side `queued` record (`sms_delivery`).
    pub fn queued(message: &QueueMessage, instance_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            measurement: Measurement::SmsDelivery,
            msg_id: message.msg_id.clone(),
            mno: message.mno.clone(),
            instance_id: instance_id.into(),
            status: DeliveryStatus::Queued,
            processing_time_ms: 0,
            retry_count: Some(0),
            queue_time_ms: Some(now),
            timestamp_ms: now,
        }
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurement = measurement;
        self
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn write(&self, records: &[DeliveryRecord]) -> Result<(), TelemetryError>;
}

/// Sink for deployments without a time-series store.
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn write(&self, _records: &[DeliveryRecord]) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Keeps everything it is given; can be told to reject writes.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<DeliveryRecord>>,
    failing: AtomicBool,
    batches: Mutex<Vec<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Size of every accepted batch, in write order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write(&self, records: &[DeliveryRecord]) -> Result<(), TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Rejected {
                status: 503,
                body: "sink unavailable".to_string(),
            });
        }
        if let Ok(mut stored) = self.records.lock() {
            stored.extend_from_slice(records);
        }
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(records.len());
        }
        Ok(())
    }
}
