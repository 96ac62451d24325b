// ============================================================================
// Consumer Statistics
// ============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-instance outcome counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    success: AtomicU64,
    failure: AtomicU64,
    rate_limited: AtomicU64,
    duplicate: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub success: u64,
    pub failure: u64,
    pub rate_limited: u64,
    pub duplicate: u64,
    pub dead_lettered: u64,
}

impl StatsSnapshot {
    pub fn processed(&self) -> u64 {
        self.success + self.failure + self.rate_limited + self.dead_lettered
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    /// Carrier failures and invalid messages
    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Log a snapshot every `every` until cancelled.
pub fn spawn_stats_logger(
    stats: Arc<WorkerStats>,
    instance_id: String,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let s = stats.snapshot();
                    info!(
                        instance = %instance_id,
                        success = s.success,
                        failure = s.failure,
                        rate_limited = s.rate_limited,
                        duplicate = s.duplicate,
                        dead_lettered = s.dead_lettered,
                        "Consumer stats"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = WorkerStats::new();
        stats.record_success();
        stats.record_success();
        stats.record_failure();
        stats.record_rate_limited();
        stats.record_duplicate();

        let s = stats.snapshot();
        assert_eq!(s.success, 2);
        assert_eq!(s.duplicate, 1);
        // duplicates are requeued, not processed
        assert_eq!(s.processed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logger_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_stats_logger(
            Arc::new(WorkerStats::new()),
            "w1".to_string(),
            Duration::from_secs(5),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
