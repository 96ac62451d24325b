// ============================================================================
// Dispatch Worker
// ============================================================================
//
// One consumer instance of the SMS dispatch pipeline.
//
// Startup:
// 1. Config from env (.env honoured), tracing
// 2. Redis (lock, rate-limit and redelivery counters)
// 3. Broker connection; if no node is reachable the manager keeps retrying
//    in the background and the consumer waits for it
// 4. Declare {queue} and {queue}.dlq
// 5. Telemetry recorder, /health + /metrics, stats logger
// 6. ConsumptionLoop until SIGTERM / Ctrl-C
//
// Shutdown:
// - stop pulling, give in-flight deliveries SHUTDOWN_GRACE_SECS
// - flush telemetry, close the broker connection
//
// INSTANCE_ID must be unique per running instance: it is the lock holder
// value, the consumer tag suffix and the telemetry `instance` tag.
//
// ============================================================================

use anyhow::{Context, Result};
use dispatch_config::Config;
use sms_dispatch::broker::amqp::AmqpDialer;
use sms_dispatch::broker::{BrokerConnectionManager, PriorityPublisher};
use sms_dispatch::store::RedisStore;
use sms_dispatch::telemetry::{InfluxSink, NoopSink, TelemetryRecorder, TelemetrySink};
use sms_dispatch::utils::redact_url;
use sms_dispatch::worker::{
    dead_letter_queue, spawn_stats_logger, ConsumptionLoop, SimulatedCarrier, WorkerContext, WorkerSettings,
};
use sms_dispatch::health;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Dispatch Worker Starting ===");
    info!("Instance: {}", config.worker.instance_id);
    info!("Queue: {}", config.broker.queue);
    info!("Rate limit strategy: {:?}", config.rate_limit.strategy);
    info!("Max workers: {}", config.worker.max_workers);

    // Connect to Redis
    info!("Connecting to Redis at: {}", redact_url(&config.redis.url));
    let store = RedisStore::connect(&config.redis.connection_url())
        .await
        .context("Failed to connect to Redis")?;
    let store = Arc::new(store);

    // Connect to the broker
    let nodes: Vec<String> = config.broker.urls.iter().map(|u| redact_url(u)).collect();
    info!("Broker nodes: {}", nodes.join(", "));
    let manager = BrokerConnectionManager::new(
        config.broker.urls.clone(),
        Arc::new(AmqpDialer::new()),
        Duration::from_secs(config.broker.reconnect_delay_secs),
    );
    if let Err(e) = manager.connect().await {
        warn!(error = %e, "No broker node reachable yet, waiting for reconnect");
        manager
            .wait_connected()
            .await
            .context("Broker connection closed before it was established")?;
    }

    let publisher = PriorityPublisher::new(Arc::clone(&manager));
    publisher
        .declare_queue(&config.broker.queue)
        .await
        .context("Failed to declare work queue")?;
    publisher
        .declare_queue(&dead_letter_queue(&config.broker.queue))
        .await
        .context("Failed to declare dead letter queue")?;

    // Telemetry
    let sink: Arc<dyn TelemetrySink> = if config.telemetry.enabled {
        info!("Telemetry: InfluxDB at {}", config.telemetry.url);
        Arc::new(InfluxSink::new(&config.telemetry).context("Failed to create InfluxDB client")?)
    } else {
        info!("Telemetry disabled");
        Arc::new(NoopSink)
    };
    let telemetry = TelemetryRecorder::new(
        sink,
        config.telemetry.batch_size,
        Duration::from_millis(config.telemetry.flush_interval_ms),
    );
    telemetry.start();

    let carrier = SimulatedCarrier::new(
        Duration::from_millis(config.worker.carrier_min_latency_ms),
        Duration::from_millis(config.worker.carrier_max_latency_ms),
        config.worker.carrier_failure_rate,
    );

    let ctx = Arc::new(WorkerContext::new(
        WorkerSettings::from_config(&config),
        store,
        publisher,
        Arc::new(carrier),
        Arc::clone(&telemetry),
    ));

    // Cancelled on SIGTERM / Ctrl-C
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let health_shutdown = shutdown.clone();
    let health_manager = Arc::clone(&manager);
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(metrics_port, health_manager, health_shutdown).await {
            error!("Health endpoint stopped: {:#}", e);
        }
    });

    let stats_logger = spawn_stats_logger(
        Arc::clone(&ctx.stats),
        config.worker.instance_id.clone(),
        Duration::from_secs(config.worker.stats_log_interval_secs),
        shutdown.clone(),
    );

    let consumer = ConsumptionLoop::new(
        Arc::clone(&manager),
        ctx,
        config.broker.prefetch_count,
        config.worker.max_workers,
        Duration::from_secs(config.worker.shutdown_grace_secs),
    );
    consumer.run(shutdown.clone()).await;

    // Graceful shutdown
    shutdown.cancel();
    telemetry.shutdown().await;
    manager.close().await;
    let _ = stats_logger.await;

    info!("=== Dispatch Worker Stopped ===");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            info!("SIGTERM received, initiating graceful shutdown...");
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("SIGINT received, initiating graceful shutdown...");
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    tokio::signal::ctrl_c().await.ok();
                    info!("SIGINT received, initiating graceful shutdown...");
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, initiating graceful shutdown...");
        }
        shutdown.cancel();
    });
}
