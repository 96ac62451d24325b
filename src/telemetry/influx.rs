// ============================================================================
// InfluxDB v2 sink
// ============================================================================

use async_trait::async_trait;
use dispatch_config::TelemetryConfig;
use dispatch_error::TelemetryError;
use std::time::Duration;

use super::line_protocol::encode_batch;
use super::{DeliveryRecord, TelemetrySink};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes batches to `POST {url}/api/v2/write?org=..&bucket=..&precision=ms`.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    async fn write(&self, records: &[DeliveryRecord]) -> Result<(), TelemetryError> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(encode_batch(records))
            .send()
            .await
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
