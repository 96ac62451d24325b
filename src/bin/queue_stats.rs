// ============================================================================
// Queue Statistics
// ============================================================================
//
// One-shot read of the RabbitMQ management API: per-queue depth and rates,
// plus the first node's resource usage. Printed as JSON.
//
// ============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use dispatch_config::Config;
use sms_dispatch::StatisticsCollector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Print broker queue and node statistics", long_about = None)]
struct Args {
    /// Only report this queue
    #[arg(long)]
    queue: Option<String>,

    /// Single-line JSON
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let broker = Config::broker_from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let collector = StatisticsCollector::new(
        &broker.management_url,
        &broker.management_user,
        &broker.management_password,
    )?;
    let mut stats = collector
        .fetch_statistics()
        .await
        .context("Failed to fetch broker statistics")?;

    if let Some(queue) = &args.queue {
        stats.queues.retain(|name, _| name == queue);
        if stats.queues.is_empty() {
            anyhow::bail!("Queue '{}' not found", queue);
        }
    }

    let json = if args.compact {
        serde_json::to_string(&stats)?
    } else {
        serde_json::to_string_pretty(&stats)?
    };
    println!("{}", json);
    Ok(())
}
