// ============================================================================
// Consumption Loop
// ============================================================================
//
// Pulls deliveries from one queue and hands each to a worker task.
//
// - At most `max_workers` deliveries are in flight; a permit is taken BEFORE
//   the next delivery is pulled, so the broker's prefetch window is the only
//   buffer
// - When the consumer stream fails or ends, the manager is signalled and the
//   loop resubscribes with the same consumer tag once a NEW channel is up
// - Cancellation stops the pull. In-flight workers get a grace period, then
//   whatever is left is aborted and its message locks released, so the
//   broker's redelivery is not bounced as a duplicate
//
// ============================================================================

use dispatch_error::ConnectionError;
use dispatch_metrics::WORKERS_IN_FLIGHT;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processor::{process_delivery, Disposition};
use super::stats::StatsSnapshot;
use super::WorkerContext;
use crate::broker::{BrokerConnectionManager, ChannelHandle};

/// Decrements the in-flight gauge even when the worker is aborted.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        WORKERS_IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        WORKERS_IN_FLIGHT.dec();
    }
}

pub struct ConsumptionLoop {
    manager: Arc<BrokerConnectionManager>,
    ctx: Arc<WorkerContext>,
    prefetch: u16,
    max_workers: usize,
    grace_period: Duration,
}

impl ConsumptionLoop {
    pub fn new(
        manager: Arc<BrokerConnectionManager>,
        ctx: Arc<WorkerContext>,
        prefetch: u16,
        max_workers: usize,
        grace_period: Duration,
    ) -> Self {
        Self {
            manager,
            ctx,
            prefetch,
            max_workers: max_workers.max(1),
            grace_period,
        }
    }

    /// Consume until `shutdown` is cancelled or the manager is closed.
    pub async fn run(&self, shutdown: CancellationToken) -> StatsSnapshot {
        let queue = self.ctx.queue.clone();
        let consumer_tag = self.ctx.consumer_tag();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut workers: JoinSet<Disposition> = JoinSet::new();
        let mut stale_generation: Option<u64> = None;

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            max_workers = self.max_workers,
            prefetch = self.prefetch,
            "Consumption loop started"
        );

        'subscribe: loop {
            let Some(channel) = self.wait_for_channel(stale_generation, &shutdown).await else {
                break;
            };

            let mut stream = match channel.consume(&queue, &consumer_tag, self.prefetch).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Subscribe failed, waiting for reconnect");
                    channel.notify_failure(format!("consume failed: {}", e));
                    stale_generation = Some(channel.generation());
                    continue;
                }
            };
            info!(queue = %queue, generation = channel.generation(), "Consumer subscribed");

            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break 'subscribe,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'subscribe,
                    },
                };

                let next = tokio::select! {
                    _ = shutdown.cancelled() => break 'subscribe,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        let ctx = Arc::clone(&self.ctx);
                        let cancel = shutdown.clone();
                        workers.spawn(async move {
                            let _permit = permit;
                            let _in_flight = InFlight::enter();
                            process_delivery(&ctx, delivery, &cancel).await
                        });
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Consumer stream failed");
                        channel.notify_failure(format!("consumer stream failed: {}", e));
                        stale_generation = Some(channel.generation());
                        break;
                    }
                    None => {
                        warn!("Consumer stream ended");
                        channel.notify_failure("consumer stream ended");
                        stale_generation = Some(channel.generation());
                        break;
                    }
                }

                reap_finished(&mut workers);
            }
        }

        info!(in_flight = workers.len(), "Stopped pulling deliveries");
        self.drain(workers).await;

        let stats = self.ctx.stats.snapshot();
        info!(
            success = stats.success,
            failure = stats.failure,
            rate_limited = stats.rate_limited,
            duplicate = stats.duplicate,
            dead_lettered = stats.dead_lettered,
            "Consumption loop stopped"
        );
        stats
    }

    /// Resolves to an open channel whose generation differs from `stale`,
    /// or `None` on shutdown / manager close.
    async fn wait_for_channel(&self, stale: Option<u64>, shutdown: &CancellationToken) -> Option<ChannelHandle> {
        loop {
            // Subscribe before looking so no transition is missed
            let mut state = self.manager.subscribe_state();

            match self.manager.channel() {
                Ok(channel) if Some(channel.generation()) != stale => return Some(channel),
                Ok(_) => debug!("Waiting for the failed channel to be replaced"),
                Err(ConnectionError::Closed) => return None,
                Err(e) => debug!(error = %e, "Waiting for broker connection"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn drain(&self, mut workers: JoinSet<Disposition>) {
        if workers.is_empty() {
            return;
        }

        let deadline = tokio::time::sleep(self.grace_period);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        remaining = workers.len(),
                        grace_secs = self.grace_period.as_secs(),
                        "Grace period elapsed, aborting in-flight deliveries"
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}

                    let released = self.ctx.lock.release_all().await;
                    if released > 0 {
                        info!(released = released, "Released locks of aborted deliveries");
                    }
                    return;
                }
                joined = workers.join_next() => match joined {
                    Some(result) => log_join(result),
                    None => return,
                },
            }
        }
    }
}

fn reap_finished(workers: &mut JoinSet<Disposition>) {
    while let Some(result) = workers.try_join_next() {
        log_join(result);
    }
}

fn log_join(result: Result<Disposition, tokio::task::JoinError>) {
    match result {
        Ok(disposition) => debug!(disposition = disposition.as_str(), "Worker finished"),
        Err(e) if e.is_panic() => error!(error = %e, "Worker panicked"),
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::PriorityPublisher;
    use crate::store::MemoryStore;
    use crate::telemetry::{MemorySink, TelemetryRecorder};
    use crate::types::{MessageType, Operator, Priority, QueueMessage};
    use crate::worker::{SimulatedCarrier, WorkerSettings};

    async fn setup(carrier: SimulatedCarrier, max_workers: usize) -> (MemoryBroker, Arc<BrokerConnectionManager>, ConsumptionLoop) {
        let broker = MemoryBroker::new();
        let manager = BrokerConnectionManager::new(
            vec!["mem://a".to_string()],
            broker.dialer(),
            Duration::from_millis(50),
        );
        manager.connect().await.unwrap();
        let publisher = PriorityPublisher::new(Arc::clone(&manager));
        publisher.declare_queue("general").await.unwrap();

        let telemetry = TelemetryRecorder::new(Arc::new(MemorySink::new()), 100, Duration::from_secs(3600));
        let ctx = WorkerContext::new(
            WorkerSettings::new("w1", "general"),
            Arc::new(MemoryStore::new()),
            publisher,
            Arc::new(carrier),
            telemetry,
        );
        let consumer = ConsumptionLoop::new(
            Arc::clone(&manager),
            Arc::new(ctx),
            10,
            max_workers,
            Duration::from_secs(1),
        );
        (broker, manager, consumer)
    }

    async fn publish(manager: &Arc<BrokerConnectionManager>, n: usize) {
        let publisher = PriorityPublisher::new(Arc::clone(manager));
        for _ in 0..n {
            let msg = QueueMessage::new("01712345678", "hi", Operator::Gp, MessageType::General);
            publisher.publish("general", &msg, Priority::from(1)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumes_until_cancelled() {
        let (broker, manager, consumer) = setup(SimulatedCarrier::instant(), 4).await;
        publish(&manager, 5).await;

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
        });

        let stats = consumer.run(shutdown).await;
        assert_eq!(stats.success, 5);
        assert_eq!(broker.ready_count("general"), 0);
        assert_eq!(broker.unacked_count("general"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_sever() {
        let (broker, manager, consumer) = setup(SimulatedCarrier::instant(), 4).await;
        let consumer = Arc::new(consumer);

        let shutdown = CancellationToken::new();
        let run = {
            let consumer = Arc::clone(&consumer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        publish(&manager, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.sever();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.active_generation().unwrap() > 1);

        publish(&manager, 3).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let stats = run.await.unwrap();
        assert_eq!(stats.success, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_aborts_slow_workers() {
        let slow = SimulatedCarrier::new(Duration::from_secs(60), Duration::from_secs(60), 0.0);
        let (broker, manager, consumer) = setup(slow, 2).await;
        publish(&manager, 2).await;

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });

        let stats = consumer.run(shutdown).await;
        assert_eq!(stats.success, 0);
        // Aborted deliveries stay unacked until the channel goes away
        assert_eq!(broker.unacked_count("general"), 2);

        manager.close().await;
        assert_eq!(broker.ready_count("general"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_deliveries_release_their_locks() {
        let slow = SimulatedCarrier::new(Duration::from_secs(60), Duration::from_secs(60), 0.0);
        let (_broker, manager, consumer) = setup(slow, 2).await;

        let publisher = PriorityPublisher::new(Arc::clone(&manager));
        let mut ids = Vec::new();
        for _ in 0..2 {
            let msg = QueueMessage::new("01712345678", "hi", Operator::Gp, MessageType::General);
            ids.push(msg.msg_id.clone());
            publisher.publish("general", &msg, Priority::from(1)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });

        let stats = consumer.run(shutdown).await;
        assert_eq!(stats.success, 0);
        assert_eq!(consumer.ctx.lock.held_count(), 0);
        for id in &ids {
            assert_eq!(consumer.ctx.lock.holder(id).await.unwrap(), None);
        }

        // A redelivery can be claimed right away instead of bouncing until the TTL
        assert!(consumer.ctx.lock.acquire(&ids[0], "w2", Duration::from_secs(30)).await.unwrap());
    }
}
