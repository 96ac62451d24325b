// ============================================================================
// Dispatch Pipeline Tests
// ============================================================================
//
// Publisher -> priority queue -> consumption loop -> lock -> rate limiter ->
// carrier -> telemetry, all over the in-process broker and store.
//
// ============================================================================

use sms_dispatch::telemetry::DeliveryStatus;
use sms_dispatch::worker::{
    dead_letter_queue, ConsumptionLoop, DeadLetterMessage, SimulatedCarrier, StatsSnapshot, WorkerContext,
    WorkerSettings,
};
use sms_dispatch::{MessageType, Operator, Priority, QueueMessage};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use test_utils::{Pipeline, QUEUE};

/// Long enough that a test never straddles two rate windows.
const TEST_WINDOW_MS: u64 = 3_600_000;

fn settings(instance: &str) -> WorkerSettings {
    let mut settings = WorkerSettings::new(instance, QUEUE);
    settings.rate_limit.window_ms = TEST_WINDOW_MS;
    settings
}

fn start(consumer: ConsumptionLoop) -> (CancellationToken, JoinHandle<StatsSnapshot>) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { consumer.run(token).await });
    (shutdown, handle)
}

async fn wait_until(ctx: &WorkerContext, done: impl Fn(&StatsSnapshot) -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if done(&ctx.stats.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline did not settle in time");
}

async fn publish(pipeline: &Pipeline, msisdn: &str, operator: Operator, priority: i64) -> QueueMessage {
    let message = QueueMessage::new(msisdn, "integration test", operator, MessageType::General);
    pipeline
        .publisher
        .publish(QUEUE, &message, Priority::clamped(priority))
        .await
        .unwrap();
    message
}

#[tokio::test(start_paused = true)]
async fn test_message_flows_end_to_end() {
    let pipeline = Pipeline::new().await;
    let carrier = SimulatedCarrier::new(Duration::from_millis(20), Duration::from_millis(40), 0.0);
    let ctx = pipeline.context(settings("worker-1"), Arc::new(carrier));

    let message = publish(&pipeline, "01812345678", Operator::Robi, 4).await;

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 4));
    wait_until(&ctx, |s| s.success == 1).await;

    // Rate window for the operator is still live
    assert_eq!(pipeline.store.keys_with_prefix("rate:mno:Robi:").len(), 1);

    shutdown.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failure, 0);

    // Locked exactly once, released afterwards
    let lock_key = format!("lock:{}", message.msg_id);
    assert_eq!(pipeline.store.set_nx_calls(&lock_key), 1);
    assert!(!pipeline.store.contains(&lock_key));

    pipeline.telemetry.flush().await.unwrap();
    let records = pipeline.sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.msg_id, message.msg_id);
    assert_eq!(record.mno, "Robi");
    assert_eq!(record.instance_id, "worker-1");
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert!(record.processing_time_ms >= 20);

    assert_eq!(pipeline.broker.ready_count(QUEUE), 0);
    assert_eq!(pipeline.broker.unacked_count(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_is_processed_first() {
    let pipeline = Pipeline::new().await;
    let ctx = pipeline.context(settings("worker-1"), Arc::new(SimulatedCarrier::instant()));

    let low = publish(&pipeline, "01712345678", Operator::Gp, 0).await;
    let high = publish(&pipeline, "01712345678", Operator::Gp, 4).await;
    let mid = publish(&pipeline, "01712345678", Operator::Gp, 2).await;

    // A single worker processes strictly in delivery order
    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 1));
    wait_until(&ctx, |s| s.success == 3).await;
    shutdown.cancel();
    handle.await.unwrap();

    pipeline.telemetry.flush().await.unwrap();
    let order: Vec<String> = pipeline.sink.records().into_iter().map(|r| r.msg_id).collect();
    assert_eq!(order, vec![high.msg_id, mid.msg_id, low.msg_id]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_messages_are_dropped() {
    let pipeline = Pipeline::new().await;
    let mut settings = settings("worker-1");
    settings.rate_limit.mno_limits = vec![("Robi".to_string(), 2)];
    let ctx = pipeline.context(settings, Arc::new(SimulatedCarrier::instant()));

    for _ in 0..5 {
        publish(&pipeline, "01812345678", Operator::Robi, 1).await;
    }

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 1));
    wait_until(&ctx, |s| s.success + s.rate_limited == 5).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.success, 2);
    assert_eq!(stats.rate_limited, 3);
    // Limited deliveries are acked, not requeued
    assert_eq!(pipeline.broker.ready_count(QUEUE), 0);
    assert_eq!(pipeline.broker.unacked_count(QUEUE), 0);

    pipeline.telemetry.flush().await.unwrap();
    let limited = pipeline
        .sink
        .records()
        .into_iter()
        .filter(|r| r.status == DeliveryStatus::RateLimited)
        .count();
    assert_eq!(limited, 3);
}

#[tokio::test(start_paused = true)]
async fn test_global_strategy_shares_one_ceiling() {
    let pipeline = Pipeline::new().await;
    let mut settings = settings("worker-1");
    settings.rate_limit.strategy = dispatch_config::RateLimitStrategy::Global;
    settings.rate_limit.global_tps = 3;
    let ctx = pipeline.context(settings, Arc::new(SimulatedCarrier::instant()));

    publish(&pipeline, "01812345678", Operator::Robi, 1).await;
    publish(&pipeline, "01712345678", Operator::Gp, 1).await;
    publish(&pipeline, "01612345678", Operator::Airtel, 1).await;
    publish(&pipeline, "01712345678", Operator::Gp, 1).await;

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 2));
    wait_until(&ctx, |s| s.success + s.rate_limited == 4).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.success, 3);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(pipeline.store.keys_with_prefix("rate:global:").len(), 1);
    assert!(pipeline.store.keys_with_prefix("rate:mno:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_dead_lettered_after_max_redeliveries() {
    let pipeline = Pipeline::new().await;
    let mut settings = settings("worker-1");
    settings.max_redeliveries = 3;
    let ctx = pipeline.context(settings, Arc::new(SimulatedCarrier::instant()));

    pipeline.broker.inject(QUEUE, b"{not json".to_vec(), 1);

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 2));
    wait_until(&ctx, |s| s.dead_lettered == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    // Two requeues, then the third attempt goes to the DLQ
    assert_eq!(stats.failure, 3);
    assert_eq!(stats.success, 0);
    assert_eq!(pipeline.broker.ready_count(QUEUE), 0);
    assert_eq!(pipeline.broker.unacked_count(QUEUE), 0);

    let dead = pipeline.broker.drain(&dead_letter_queue(QUEUE));
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0, 0);
    let parked: DeadLetterMessage = serde_json::from_slice(&dead[0].1).unwrap();
    assert_eq!(parked.msg_id, None);
    assert_eq!(parked.body, "{not json");
    assert_eq!(parked.retry_count, 3);
    assert_eq!(parked.instance_id, "worker-1");
    assert!(parked.failure_reason.contains("malformed"));

    // Counter is cleared once the message has left the queue
    assert!(pipeline.store.keys_with_prefix("retry_count:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_two_instances_deliver_each_message_once() {
    let pipeline = Pipeline::new().await;
    let carrier = Arc::new(SimulatedCarrier::new(
        Duration::from_millis(1),
        Duration::from_millis(10),
        0.0,
    ));
    let ctx_a = pipeline.context(settings("worker-a"), carrier.clone());
    let ctx_b = pipeline.context(settings("worker-b"), carrier);

    let mut published = HashSet::new();
    for i in 0..40 {
        let (msisdn, operator) = match i % 3 {
            0 => ("01812345678", Operator::Robi),
            1 => ("01712345678", Operator::Gp),
            _ => ("01612345678", Operator::Airtel),
        };
        published.insert(publish(&pipeline, msisdn, operator, i % 5).await.msg_id);
    }

    let (stop_a, handle_a) = start(pipeline.consumer(Arc::clone(&ctx_a), 4));
    let (stop_b, handle_b) = start(pipeline.consumer(Arc::clone(&ctx_b), 4));

    tokio::time::timeout(Duration::from_secs(30), async {
        while ctx_a.stats.snapshot().success + ctx_b.stats.snapshot().success < 40 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both instances should drain the queue");

    stop_a.cancel();
    stop_b.cancel();
    let a = handle_a.await.unwrap();
    let b = handle_b.await.unwrap();
    assert_eq!(a.success + b.success, 40);

    pipeline.telemetry.flush().await.unwrap();
    let records = pipeline.sink.records();
    let delivered: Vec<String> = records
        .iter()
        .filter(|r| r.status == DeliveryStatus::Delivered)
        .map(|r| r.msg_id.clone())
        .collect();
    let unique: HashSet<String> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), 40);
    assert_eq!(unique, published);

    // Every lock was taken by exactly one set-if-absent call
    for id in &published {
        assert_eq!(pipeline.store.set_nx_calls(&format!("lock:{}", id)), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_finishes_in_flight_work() {
    let pipeline = Pipeline::new().await;
    let carrier = SimulatedCarrier::new(Duration::from_millis(500), Duration::from_millis(500), 0.0);
    let ctx = pipeline.context(settings("worker-1"), Arc::new(carrier));

    for _ in 0..6 {
        publish(&pipeline, "01612345678", Operator::Airtel, 1).await;
    }

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 2));

    // Two workers are mid-submission; the grace period (2s) covers them
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.success, 2);
    assert_eq!(pipeline.broker.unacked_count(QUEUE), 0);
    // Never pulled, so still ready for the next instance
    assert_eq!(pipeline.broker.ready_count(QUEUE), 4);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_survives_broker_restart() {
    let pipeline = Pipeline::new().await;
    let ctx = pipeline.context(settings("worker-1"), Arc::new(SimulatedCarrier::instant()));

    let (shutdown, handle) = start(pipeline.consumer(Arc::clone(&ctx), 2));

    for _ in 0..3 {
        publish(&pipeline, "01812345678", Operator::Robi, 1).await;
    }
    wait_until(&ctx, |s| s.success == 3).await;

    pipeline.broker.sever();
    pipeline.manager.wait_connected().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.manager.channel().is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel should come back");

    for _ in 0..3 {
        publish(&pipeline, "01812345678", Operator::Robi, 1).await;
    }
    wait_until(&ctx, |s| s.success == 6).await;

    shutdown.cancel();
    assert_eq!(handle.await.unwrap().success, 6);
}
