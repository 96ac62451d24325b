// ============================================================================
// Telemetry Recorder
// ============================================================================
//
// `record()` only appends to an in-memory buffer and returns. A background
// task drains the buffer to the sink on a fixed interval, or early once the
// buffer reaches the batch size. Write failures go to an error channel that a
// second task drains into the log, so the caller never sees them.
//
// If the sink stays down the buffer is capped; beyond the cap new records are
// dropped and counted.
//
// ============================================================================

use dispatch_error::TelemetryError;
use dispatch_metrics::{TELEMETRY_POINTS_WRITTEN, TELEMETRY_WRITE_FAILURES};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeliveryRecord, TelemetrySink};

/// Buffered records kept while the sink is failing, in batches.
const MAX_BUFFERED_BATCHES: usize = 10;

pub struct TelemetryRecorder {
    sink: Arc<dyn TelemetrySink>,
    buffer: Mutex<Vec<DeliveryRecord>>,
    batch_size: usize,
    flush_interval: Duration,
    flush_now: Notify,
    flush_lock: AsyncMutex<()>,
    errors_tx: mpsc::UnboundedSender<TelemetryError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<TelemetryError>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

impl TelemetryRecorder {
    pub fn new(sink: Arc<dyn TelemetrySink>, batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sink,
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            flush_interval,
            flush_now: Notify::new(),
            flush_lock: AsyncMutex::new(()),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        })
    }

    /// Buffer a record. Never blocks on I/O and never fails.
    pub fn record(&self, record: DeliveryRecord) {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(msg_id = %record.msg_id, "Telemetry recorder closed, record dropped");
            return;
        }

        let len = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
            if buffer.len() >= self.batch_size * MAX_BUFFERED_BATCHES {
                drop(buffer);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            buffer.push(record);
            buffer.len()
        };

        if len >= self.batch_size {
            self.flush_now.notify_one();
        }
    }

    /// Write everything buffered, in batches of at most `batch_size`.
    ///
    /// Records of a batch the sink rejects are discarded; telemetry is
    /// best-effort and retrying would only grow the backlog.
    pub async fn flush(&self) -> Result<usize, TelemetryError> {
        let _flushing = self.flush_lock.lock().await;

        let pending: Vec<DeliveryRecord> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *buffer)
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut first_error = None;
        for batch in pending.chunks(self.batch_size) {
            match self.sink.write(batch).await {
                Ok(()) => {
                    written += batch.len();
                    TELEMETRY_POINTS_WRITTEN.inc_by(batch.len() as u64);
                }
                Err(e) => {
                    TELEMETRY_WRITE_FAILURES.inc();
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(points = written, "Telemetry batch flushed");
                Ok(written)
            }
        }
    }

    /// Start the flush loop and the error logger.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let errors_rx = self
            .errors_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut errors_rx) = errors_rx {
            handles.push(tokio::spawn(async move {
                while let Some(e) = errors_rx.recv().await {
                    warn!(error = %e, "Telemetry write failed");
                }
            }));
        }

        let recorder = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(recorder.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                batch_size = recorder.batch_size,
                flush_interval_ms = recorder.flush_interval.as_millis() as u64,
                "Telemetry recorder started"
            );

            loop {
                tokio::select! {
                    _ = recorder.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = recorder.flush_now.notified() => {}
                }

                if let Err(e) = recorder.flush().await {
                    let _ = recorder.errors_tx.send(e);
                }
            }
        }));

        handles
    }

    /// Stop accepting records, stop the flush loop and write what is left.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        match self.flush().await {
            Ok(points) => info!(points = points, "Telemetry recorder flushed on shutdown"),
            Err(e) => warn!(error = %e, "Final telemetry flush failed"),
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped = dropped, "Telemetry records dropped");
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
