// ============================================================================
// SMS Load Generator
// ============================================================================
//
// Publishes N messages for one subscriber number into the work queue and
// records a `queued` telemetry point (sms_delivery) for each.
//
// The operator is taken from the number's prefix. A failed publish is
// retried after the connection manager reports Connected again; the
// publisher itself never retries.
//
// ============================================================================

use anyhow::{bail, Context, Result};
use clap::Parser;
use dispatch_config::Config;
use dispatch_error::{ConnectionError, PublishError};
use sms_dispatch::broker::amqp::AmqpDialer;
use sms_dispatch::broker::{BrokerConnectionManager, PriorityPublisher};
use sms_dispatch::telemetry::{DeliveryRecord, InfluxSink, NoopSink, TelemetryRecorder, TelemetrySink};
use sms_dispatch::utils::mask_msisdn;
use sms_dispatch::{CarrierClassifier, MessageType, Priority, QueueMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PUBLISH_ATTEMPTS: u32 = 3;
const RECONNECT_WAIT: Duration = Duration::from_secs(30);
/// Gives the manager time to act on the failure signal before we wait on it
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(version, about = "Bulk-publish SMS messages into the dispatch queue", long_about = None)]
struct Args {
    /// Messages to publish
    #[arg(long, default_value_t = 10_000)]
    count: u64,

    /// Target queue (defaults to RABBITMQ_QUEUE)
    #[arg(long)]
    queue: Option<String>,

    /// Broker priority; values outside 0..=4 are clamped
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    priority: i64,

    #[arg(long, default_value = "01814266295")]
    msisdn: String,

    #[arg(long, default_value = "hello from sms_loadgen")]
    text: String,

    /// Telemetry `instance` tag
    #[arg(long, default_value = "loadgen")]
    instance_id: String,

    /// Log progress every N messages
    #[arg(long, default_value_t = 10_000)]
    progress_every: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let broker = Config::broker_from_env()?;
    let telemetry_config = Config::telemetry_from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let operator = CarrierClassifier::new()
        .classify(&args.msisdn)
        .with_context(|| format!("Cannot route {}", mask_msisdn(&args.msisdn)))?;
    let priority = Priority::clamped(args.priority);
    let queue = args.queue.unwrap_or_else(|| broker.queue.clone());

    let manager = BrokerConnectionManager::new(
        broker.urls.clone(),
        Arc::new(AmqpDialer::new()),
        Duration::from_secs(broker.reconnect_delay_secs),
    );
    manager.connect().await.context("Failed to connect to broker")?;

    let publisher = PriorityPublisher::new(Arc::clone(&manager));
    publisher
        .declare_queue(&queue)
        .await
        .context("Failed to declare queue")?;

    let sink: Arc<dyn TelemetrySink> = if telemetry_config.enabled {
        Arc::new(InfluxSink::new(&telemetry_config).context("Failed to create InfluxDB client")?)
    } else {
        Arc::new(NoopSink)
    };
    let telemetry = TelemetryRecorder::new(
        sink,
        telemetry_config.batch_size,
        Duration::from_millis(telemetry_config.flush_interval_ms),
    );
    telemetry.start();

    info!(
        count = args.count,
        queue = %queue,
        priority = priority.value(),
        mno = %operator,
        "Starting bulk publish"
    );
    let started = Instant::now();

    let mut result: Result<()> = Ok(());
    for i in 0..args.count {
        let message = QueueMessage::new(&args.msisdn, &args.text, operator, MessageType::General);

        if let Err(e) = publish_with_retry(&manager, &publisher, &queue, &message, priority).await {
            result = Err(e).with_context(|| format!("Failed to publish message {}", i));
            break;
        }
        telemetry.record(DeliveryRecord::queued(&message, &args.instance_id));

        if args.progress_every > 0 && (i + 1) % args.progress_every == 0 {
            info!(
                "Published {} of {} messages ({:.2}%) in {:?}",
                i + 1,
                args.count,
                (i + 1) as f64 / args.count as f64 * 100.0,
                started.elapsed()
            );
        }
    }

    telemetry.shutdown().await;
    manager.close().await;
    result?;

    let elapsed = started.elapsed();
    info!(
        "Completed: published {} messages to {} in {:?} ({:.2} msg/s)",
        args.count,
        queue,
        elapsed,
        args.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

async fn publish_with_retry(
    manager: &Arc<BrokerConnectionManager>,
    publisher: &PriorityPublisher,
    queue: &str,
    message: &QueueMessage,
    priority: Priority,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match publisher.publish(queue, message, priority).await {
            Ok(()) => return Ok(()),
            Err(PublishError::Encode(e)) => return Err(e.into()),
            Err(PublishError::Connection(ConnectionError::Closed)) => return Err(ConnectionError::Closed.into()),
            Err(e) if attempt < PUBLISH_ATTEMPTS => {
                warn!(attempt = attempt, error = %e, "Publish failed, waiting for broker");
                tokio::time::sleep(RETRY_BACKOFF).await;
                match tokio::time::timeout(RECONNECT_WAIT, manager.wait_connected()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => bail!("Broker did not reconnect within {:?}", RECONNECT_WAIT),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sms_dispatch::broker::memory::MemoryBroker;
    use sms_dispatch::Operator;

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_manager_closes() {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(vec!["mem://a".to_string()], broker.dialer(), Duration::from_secs(5));
        let publisher = PriorityPublisher::new(Arc::clone(&manager));
        let message = QueueMessage::new("01812345678", "hi", Operator::Robi, MessageType::General);

        let closer = Arc::clone(&manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            closer.close().await;
        });

        let started = tokio::time::Instant::now();
        let err = publish_with_retry(&manager, &publisher, "general", &message, Priority::LOWEST)
            .await
            .unwrap_err();

        assert_eq!(err.downcast_ref::<ConnectionError>(), Some(&ConnectionError::Closed));
        // Gave up after the first backoff instead of retrying against a closed manager
        assert!(started.elapsed() < RETRY_BACKOFF * 2);
        assert_eq!(broker.published_count("general"), 0);
    }
}
