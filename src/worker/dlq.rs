// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// Stops permanently invalid messages from being redelivered forever.
//
// - Each requeue of a malformed / unroutable delivery increments
//   retry_count:{key} in the shared store (TTL refreshed on every increment)
// - key is the msg_id, or a body fingerprint when no msg_id can be decoded
// - Once the count reaches max_redeliveries the raw body is published to
//   {queue}.dlq together with the failure reason, and the delivery is acked
// - max_redeliveries = 0 disables the guard: invalid messages are requeued
//   forever
//
// Lock contention never goes through here.
//
// ============================================================================

use dispatch_error::{PublishError, StoreError};
use dispatch_metrics::DEAD_LETTERED_TOTAL;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::broker::{MessageProperties, PriorityPublisher};
use crate::store::SharedStore;
use crate::types::Priority;

pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Counters outlive any realistic redelivery loop
pub const REDELIVERY_COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// What to do with a delivery that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryVerdict {
    Requeue { attempts: u32 },
    DeadLetter { attempts: u32 },
}

/// A message moved to the DLQ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    /// `None` when the body could not be decoded at all
    pub msg_id: Option<String>,
    /// Original body, lossily decoded as UTF-8
    pub body: String,
    pub failure_reason: String,
    pub retry_count: u32,
    pub instance_id: String,
    /// Unix timestamp (seconds)
    pub dead_lettered_at: i64,
}

pub struct DeadLetterGuard {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    max_redeliveries: u32,
}

impl DeadLetterGuard {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, max_redeliveries: u32) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            max_redeliveries,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_redeliveries > 0
    }

    /// Count one more failed attempt for `key`.
    ///
    /// A store error keeps the message in the queue: losing the counter only
    /// delays dead-lettering.
    pub async fn record_failure(&self, key: &str) -> RedeliveryVerdict {
        if !self.is_enabled() {
            return RedeliveryVerdict::Requeue { attempts: 0 };
        }

        match self.increment(key).await {
            Ok(attempts) if attempts >= self.max_redeliveries => {
                error!(
                    key = %key,
                    retry_count = attempts,
                    max_redeliveries = self.max_redeliveries,
                    "Message exceeded max redeliveries - will be dead-lettered"
                );
                RedeliveryVerdict::DeadLetter { attempts }
            }
            Ok(attempts) => {
                warn!(
                    key = %key,
                    retry_count = attempts,
                    max_redeliveries = self.max_redeliveries,
                    "Invalid message requeued"
                );
                RedeliveryVerdict::Requeue { attempts }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to update redelivery counter");
                RedeliveryVerdict::Requeue { attempts: 0 }
            }
        }
    }

    /// Drop the counter once a message has left the queue for good.
    pub async fn clear(&self, key: &str) {
        if let Err(e) = self.store.del(&self.counter_key(key)).await {
            warn!(key = %key, error = %e, "Failed to clear redelivery counter");
        }
    }

    pub fn counter_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn increment(&self, key: &str) -> Result<u32, StoreError> {
        let counter = self.counter_key(key);
        let count = self.store.incr(&counter).await?;
        self.store.expire(&counter, REDELIVERY_COUNTER_TTL).await?;
        Ok(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
    }
}

/// Publish a dead-lettered message to `{queue}.dlq`.
pub async fn send_to_dlq(
    publisher: &PriorityPublisher,
    queue: &str,
    message: &DeadLetterMessage,
) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(message)?;
    let mut properties = MessageProperties::persistent(Priority::LOWEST);
    if let Some(id) = &message.msg_id {
        properties = properties.with_message_id(id.clone());
    }

    let dlq = dead_letter_queue(queue);
    publisher.publish_raw(&dlq, &payload, &properties).await?;
    DEAD_LETTERED_TOTAL.inc();

    warn!(
        msg_id = message.msg_id.as_deref().unwrap_or("-"),
        retry_count = message.retry_count,
        dlq = %dlq,
        reason = %message.failure_reason,
        "Message moved to dead letter queue"
    );
    Ok(())
}
