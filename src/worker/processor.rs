// ============================================================================
// Delivery Processor
// ============================================================================
//
// One broker delivery, start to finish:
//
// 1. Decode the body             invalid   -> requeue (or dead-letter)
// 2. Acquire lock:{msg_id}       held      -> requeue as duplicate
// 3. Resolve the operator        unknown   -> requeue (or dead-letter), release
// 4. Rate limiter for its scope  exceeded  -> ack without submission, release
// 5. Carrier submission          delivered / failed -> ack, release
//
// Every delivery is settled exactly once. Telemetry is recorded without
// waiting and never changes the settlement.
//
// ============================================================================

use dispatch_error::ValidationError;
use dispatch_metrics::{DELIVERIES_TOTAL, PROCESSING_TIME_SECONDS};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dlq::{send_to_dlq, DeadLetterMessage, RedeliveryVerdict};
use super::{CarrierOutcome, WorkerContext};
use crate::broker::Delivery;
use crate::telemetry::{DeliveryRecord, DeliveryStatus, Measurement};
use crate::types::{Operator, QueueMessage};
use crate::utils::{body_fingerprint, mask_msisdn};

const UNKNOWN_MNO: &str = "unknown";

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Carrier accepted the message; acked
    Delivered,
    /// Carrier rejected the message; acked, not retried
    Failed,
    /// Over the rate ceiling; acked and dropped
    RateLimited,
    /// Lock held by another worker; requeued
    Duplicate,
    /// Invalid or transiently unprocessable; requeued
    Requeued,
    /// Published to the DLQ; acked
    DeadLettered,
    /// Shutdown observed before carrier submission; requeued
    Cancelled,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Delivered => "delivered",
            Disposition::Failed => "failed",
            Disposition::RateLimited => "rate_limited",
            Disposition::Duplicate => "duplicate",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Cancelled => "cancelled",
        }
    }
}

pub async fn process_delivery(ctx: &WorkerContext, delivery: Delivery, cancel: &CancellationToken) -> Disposition {
    let message = match QueueMessage::decode(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            let key = delivery
                .message_id
                .clone()
                .unwrap_or_else(|| body_fingerprint(&delivery.body));
            return reject_invalid(ctx, &delivery, None, &key, e).await;
        }
    };

    match ctx.lock.acquire(&message.msg_id, &ctx.instance_id, ctx.lock_ttl).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(msg_id = %message.msg_id, "Message locked by another worker, requeueing");
            ctx.stats.record_duplicate();
            count(Disposition::Duplicate, mno_label(&message.mno));
            nack_requeue(&delivery, &message.msg_id).await;
            return Disposition::Duplicate;
        }
        Err(e) => {
            warn!(msg_id = %message.msg_id, error = %e, "Lock store unavailable, requeueing");
            count(Disposition::Requeued, mno_label(&message.mno));
            nack_requeue(&delivery, &message.msg_id).await;
            return Disposition::Requeued;
        }
    }

    let disposition = process_locked(ctx, &delivery, &message, cancel).await;

    if let Err(e) = ctx.lock.release(&message.msg_id).await {
        // The TTL still bounds how long the lock can outlive us
        warn!(msg_id = %message.msg_id, error = %e, "Failed to release message lock");
    }
    disposition
}

async fn process_locked(
    ctx: &WorkerContext,
    delivery: &Delivery,
    message: &QueueMessage,
    cancel: &CancellationToken,
) -> Disposition {
    let started = Instant::now();

    let operator = match ctx.classifier.resolve(message) {
        Ok(operator) => operator,
        Err(e) => return reject_invalid(ctx, delivery, Some(message), &message.msg_id, e).await,
    };

    let (scope, limit) = ctx.policy.scope_for(operator);
    let allowed = match ctx.limiter.allow(&scope, limit).await {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(msg_id = %message.msg_id, scope = %scope, error = %e, "Rate limiter unavailable, treating as limited");
            false
        }
    };
    if !allowed {
        debug!(msg_id = %message.msg_id, scope = %scope, limit = limit, "Rate limit exceeded, dropping");
        ctx.stats.record_rate_limited();
        count(Disposition::RateLimited, operator.as_str());
        record(ctx, message, operator, DeliveryStatus::RateLimited, started);
        ack(delivery, &message.msg_id).await;
        return Disposition::RateLimited;
    }

    if cancel.is_cancelled() {
        debug!(msg_id = %message.msg_id, "Shutting down before submission, requeueing");
        nack_requeue(delivery, &message.msg_id).await;
        return Disposition::Cancelled;
    }

    let outcome = ctx.carrier.submit(message, operator).await;
    let elapsed = started.elapsed();
    PROCESSING_TIME_SECONDS
        .with_label_values(&[operator.as_str()])
        .observe(elapsed.as_secs_f64());

    let disposition = match outcome {
        CarrierOutcome::Delivered => {
            ctx.stats.record_success();
            record(ctx, message, operator, DeliveryStatus::Delivered, started);
            debug!(
                msg_id = %message.msg_id,
                msisdn = %mask_msisdn(&message.msisdn),
                mno = %operator,
                processing_time_ms = elapsed.as_millis() as u64,
                "SMS delivered"
            );
            Disposition::Delivered
        }
        CarrierOutcome::Failed(reason) => {
            ctx.stats.record_failure();
            record(ctx, message, operator, DeliveryStatus::Failed, started);
            warn!(
                msg_id = %message.msg_id,
                mno = %operator,
                reason = %reason,
                "Carrier submission failed"
            );
            Disposition::Failed
        }
    };

    count(disposition.clone(), operator.as_str());
    ack(delivery, &message.msg_id).await;
    disposition
}

/// Requeue an invalid delivery, or dead-letter it once it has come back too
/// often.
async fn reject_invalid(
    ctx: &WorkerContext,
    delivery: &Delivery,
    message: Option<&QueueMessage>,
    key: &str,
    error: ValidationError,
) -> Disposition {
    let mno = message.map_or(UNKNOWN_MNO, |m| mno_label(&m.mno));
    warn!(key = %key, mno = %mno, error = %error, "Invalid message");
    ctx.stats.record_failure();

    let attempts = match ctx.dead_letters.record_failure(key).await {
        RedeliveryVerdict::Requeue { .. } => {
            count(Disposition::Requeued, mno);
            nack_requeue(delivery, key).await;
            return Disposition::Requeued;
        }
        RedeliveryVerdict::DeadLetter { attempts } => attempts,
    };

    let dead = DeadLetterMessage {
        msg_id: message.map(|m| m.msg_id.clone()),
        body: String::from_utf8_lossy(&delivery.body).into_owned(),
        failure_reason: error.to_string(),
        retry_count: attempts,
        instance_id: ctx.instance_id.clone(),
        dead_lettered_at: chrono::Utc::now().timestamp(),
    };

    if let Err(e) = send_to_dlq(&ctx.publisher, &ctx.queue, &dead).await {
        warn!(key = %key, error = %e, "Dead-letter publish failed, requeueing");
        count(Disposition::Requeued, mno);
        nack_requeue(delivery, key).await;
        return Disposition::Requeued;
    }

    ctx.dead_letters.clear(key).await;
    ctx.stats.record_dead_lettered();
    count(Disposition::DeadLettered, mno);
    if let Some(message) = message {
        ctx.telemetry.record(DeliveryRecord::event(
            message.msg_id.clone(),
            mno,
            ctx.instance_id.clone(),
            DeliveryStatus::DeadLettered,
        ));
    }
    ack(delivery, key).await;
    Disposition::DeadLettered
}

fn record(ctx: &WorkerContext, message: &QueueMessage, operator: Operator, status: DeliveryStatus, started: Instant) {
    let mut record = DeliveryRecord::event(message.msg_id.clone(), operator.as_str(), ctx.instance_id.clone(), status)
        .with_processing_time(started.elapsed());
    // The carrier's verdict ends the message's lifecycle
    if matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Failed) {
        record = record.with_measurement(Measurement::FinalSmsDelivery);
    }
    ctx.telemetry.record(record);
}

/// Metric label for an unvalidated `mno` field
fn mno_label(raw: &str) -> &'static str {
    raw.parse::<Operator>().map_or(UNKNOWN_MNO, |op| op.as_str())
}

fn count(disposition: Disposition, mno: &str) {
    DELIVERIES_TOTAL
        .with_label_values(&[disposition.as_str(), mno])
        .inc();
}

// A failed ack/nack means the channel is gone; the broker redelivers
// everything that was unacked on it.
async fn ack(delivery: &Delivery, id: &str) {
    if let Err(e) = delivery.ack().await {
        warn!(msg_id = %id, error = %e, "Failed to ack delivery");
    }
}

async fn nack_requeue(delivery: &Delivery, id: &str) {
    if let Err(e) = delivery.nack(true).await {
        warn!(msg_id = %id, error = %e, "Failed to nack delivery");
    } else {
        debug!(msg_id = %id, "Delivery requeued");
    }
}
