// ============================================================================
// Priority Publisher
// ============================================================================
//
// Declares priority queues and publishes persistent JSON messages through
// the connection manager's shared channel.
//
// There is no retry loop here. A failed publish raises the reconnect signal
// for the channel it was attempted on and returns the error; whether to try
// again is the caller's decision.
//
// ============================================================================

use dispatch_config::constants::MAX_PRIORITY;
use dispatch_error::PublishError;
use dispatch_metrics::PUBLISH_TOTAL;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BrokerConnectionManager, MessageProperties};
use crate::types::{Priority, QueueMessage};

#[derive(Clone)]
pub struct PriorityPublisher {
    manager: Arc<BrokerConnectionManager>,
}

impl PriorityPublisher {
    pub fn new(manager: Arc<BrokerConnectionManager>) -> Self {
        Self { manager }
    }

    /// Idempotently declare a durable queue with `x-max-priority = 4`.
    pub async fn declare_queue(&self, name: &str) -> Result<(), PublishError> {
        let channel = self.manager.channel()?;
        channel
            .declare_priority_queue(name, MAX_PRIORITY)
            .await
            .map_err(|e| PublishError::Declaration {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(queue = name, max_priority = MAX_PRIORITY, "Queue declared");
        Ok(())
    }

    /// Publish a message as persistent JSON with the given broker priority.
    pub async fn publish(&self, queue: &str, message: &QueueMessage, priority: Priority) -> Result<(), PublishError> {
        let body = message.encode()?;
        let properties = MessageProperties::persistent(priority).with_message_id(message.msg_id.clone());
        self.publish_raw(queue, &body, &properties).await
    }

    /// Publish an already-encoded body. Used for dead-lettering, where the
    /// original bytes may not decode.
    pub async fn publish_raw(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let channel = match self.manager.channel() {
            Ok(channel) => channel,
            Err(e) => {
                PUBLISH_TOTAL.with_label_values(&[queue, "channel_not_open"]).inc();
                return Err(e.into());
            }
        };

        match channel.publish(queue, body, properties).await {
            Ok(()) => {
                PUBLISH_TOTAL.with_label_values(&[queue, "success"]).inc();
                debug!(
                    queue = queue,
                    priority = properties.priority.value(),
                    message_id = properties.message_id.as_deref().unwrap_or(""),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                PUBLISH_TOTAL.with_label_values(&[queue, "failure"]).inc();
                warn!(queue = queue, error = %e, "Publish failed, signalling reconnect");
                channel.notify_failure(format!("publish failed: {}", e));
                Err(PublishError::Publish {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
