// ============================================================================
// Broker Connection Manager
// ============================================================================
//
// State machine:
//
//   Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...
//                                                   any -> Closed (close())
//
// Every successful dial gets a new generation number. Failure signals carry
// the generation of the channel that failed and travel over an mpsc channel
// to a single supervisor task; a signal for a generation that is no longer
// active is stale and ignored. Reconnects run under `reconnect_lock`, so
// concurrent publish/consume failures never dial in parallel.
//
// Callers never wait for a channel: `channel()` answers immediately with
// ChannelNotOpen while no channel is active.
//
// ============================================================================

use dispatch_error::ConnectionError;
use dispatch_metrics::{BROKER_CONNECTION_STATE, BROKER_RECONNECTS_TOTAL};
use futures_util::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BrokerChannel, BrokerDialer, DeliveryStream, MessageProperties};
use crate::utils::redact_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; only reached through `close()`
    Closed,
}

impl ConnectionState {
    fn gauge_value(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Closed => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
enum ManagerEvent {
    ChannelFailed { generation: u64, reason: String },
}

/// Handed to the dialer and to every channel handle; fires the reconnect
/// signal for one specific channel generation.
#[derive(Clone)]
pub struct FailureNotifier {
    generation: u64,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl FailureNotifier {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A notifier that leads nowhere, for driving channels outside a manager.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (events, _) = mpsc::unbounded_channel();
        Self {
            generation: 0,
            events,
        }
    }

    pub fn notify(&self, reason: impl Into<String>) {
        // Send only fails once the manager is gone, when nobody needs a reconnect
        let _ = self.events.send(ManagerEvent::ChannelFailed {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

struct ActiveChannel {
    generation: u64,
    url: String,
    channel: Arc<dyn BrokerChannel>,
    /// Serializes every operation on this generation's channel
    io: Arc<Mutex<()>>,
}

pub struct BrokerConnectionManager {
    urls: Vec<String>,
    dialer: Arc<dyn BrokerDialer>,
    reconnect_delay: Duration,
    active: RwLock<Option<ActiveChannel>>,
    reconnect_lock: Mutex<()>,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ManagerEvent>>>,
    shutdown: CancellationToken,
}

impl BrokerConnectionManager {
    pub fn new(urls: Vec<String>, dialer: Arc<dyn BrokerDialer>, reconnect_delay: Duration) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        BROKER_CONNECTION_STATE.set(ConnectionState::Disconnected.gauge_value());

        Arc::new(Self {
            urls,
            dialer,
            reconnect_delay,
            active: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            state_tx,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Dial the configured nodes in order; the first that accepts wins.
    ///
    /// On failure the error is returned and a background reconnect loop is
    /// started, so a broker that is down at startup is picked up later
    /// without restarting the process.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionState, ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        if self.urls.is_empty() {
            return Err(ConnectionError::NoNodes);
        }
        self.ensure_supervisor();

        let _guard = self.reconnect_lock.lock().await;
        if self.active_generation().is_some() {
            return Ok(self.state());
        }

        self.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ConnectionError::Closed),
            r = self.dial_first() => r,
        };

        match result {
            Ok(_) => {
                self.set_state(ConnectionState::Connected);
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(error = %e, "Initial broker connection failed, retrying in background");
                // Generation 0 means "no channel": the supervisor treats it as current
                self.notify_failure(0, e.to_string());
                Err(e)
            }
        }
    }

    /// The active channel, or `ChannelNotOpen` right away if there is none.
    pub fn channel(&self) -> Result<ChannelHandle, ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        let active = self.active.read().unwrap_or_else(|p| p.into_inner());
        let active = active.as_ref().ok_or(ConnectionError::ChannelNotOpen)?;

        let notifier = FailureNotifier {
            generation: active.generation,
            events: self.events_tx.clone(),
        };
        if !active.channel.is_open() {
            notifier.notify("channel found closed");
            return Err(ConnectionError::ChannelNotOpen);
        }

        Ok(ChannelHandle {
            channel: Arc::clone(&active.channel),
            io: Arc::clone(&active.io),
            notifier,
        })
    }

    /// Raise the reconnect signal for a channel generation.
    pub fn notify_failure(&self, generation: u64, reason: impl Into<String>) {
        FailureNotifier {
            generation,
            events: self.events_tx.clone(),
        }
        .notify(reason);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the manager is `Connected`; errors if it is closed first.
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed);
            }
        }
    }

    pub fn active_generation(&self) -> Option<u64> {
        let active = self.active.read().unwrap_or_else(|p| p.into_inner());
        active.as_ref().map(|a| a.generation)
    }

    /// Node serving the active channel, credentials masked.
    pub fn active_node(&self) -> Option<String> {
        let active = self.active.read().unwrap_or_else(|p| p.into_inner());
        active.as_ref().map(|a| redact_url(&a.url))
    }

    /// Stop reconnecting, close the active channel and enter `Closed`.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let _guard = self.reconnect_lock.lock().await;

        let previous = self
            .active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(previous) = previous {
            if let Err(e) = previous.channel.close().await {
                warn!(error = %e, "Error while closing broker channel");
            }
        }
        self.set_state(ConnectionState::Closed);
        info!("Broker connection closed");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        BROKER_CONNECTION_STATE.set(state.gauge_value());
        if previous != state {
            debug!(from = %previous, to = %state, "Broker connection state changed");
        }
    }

    async fn dial_first(&self) -> Result<u64, ConnectionError> {
        let mut last_error = String::new();

        for url in &self.urls {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let notifier = FailureNotifier {
                generation,
                events: self.events_tx.clone(),
            };

            match self.dialer.dial(url, notifier).await {
                Ok(channel) => {
                    info!(node = %redact_url(url), generation = generation, "Connected to broker node");
                    *self.active.write().unwrap_or_else(|p| p.into_inner()) = Some(ActiveChannel {
                        generation,
                        url: url.clone(),
                        channel,
                        io: Arc::new(Mutex::new(())),
                    });
                    return Ok(generation);
                }
                Err(e) => {
                    warn!(node = %redact_url(url), error = %e, "Broker node unavailable");
                    last_error = e.to_string();
                }
            }
        }

        Err(ConnectionError::AllNodesFailed {
            attempted: self.urls.len(),
            last: last_error,
        })
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(ManagerEvent::ChannelFailed { generation, reason }) => {
                            manager.reconnect(generation, &reason).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Broker supervisor stopped");
        });
    }

    async fn reconnect(&self, failed_generation: u64, reason: &str) {
        let _guard = self.reconnect_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        let current = self.active_generation().unwrap_or(0);
        if failed_generation != current {
            debug!(
                failed_generation = failed_generation,
                current_generation = current,
                "Ignoring stale broker failure signal"
            );
            return;
        }

        warn!(generation = failed_generation, reason = reason, "Broker channel lost, reconnecting");
        let previous = self
            .active
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        self.set_state(ConnectionState::Reconnecting);

        if let Some(previous) = previous {
            // Closing a dead connection can hang until the socket times out
            tokio::spawn(async move {
                let _ = previous.channel.close().await;
            });
        }

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                r = self.dial_first() => r,
            };

            match result {
                Ok(generation) => {
                    BROKER_RECONNECTS_TOTAL.inc();
                    self.set_state(ConnectionState::Connected);
                    info!(generation = generation, attempts = attempt, "Broker reconnected");
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        retry_in_secs = self.reconnect_delay.as_secs_f64(),
                        error = %e,
                        "Broker reconnect failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

/// A snapshot of the active channel. Operations are serialized with every
/// other user of the same channel generation; a replaced generation never
/// holds up its successor.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn BrokerChannel>,
    io: Arc<Mutex<()>>,
    notifier: FailureNotifier,
}

impl ChannelHandle {
    pub fn generation(&self) -> u64 {
        self.notifier.generation()
    }

    /// Raise the reconnect signal for this handle's channel.
    pub fn notify_failure(&self, reason: impl Into<String>) {
        self.notifier.notify(reason);
    }

    pub async fn declare_priority_queue(&self, name: &str, max_priority: u8) -> Result<(), ConnectionError> {
        let _io = self.io.lock().await;
        self.channel.declare_priority_queue(name, max_priority).await
    }

    pub async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), ConnectionError> {
        let _io = self.io.lock().await;
        self.channel.publish(queue, body, properties).await
    }

    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, ConnectionError> {
        let stream = {
            let _io = self.io.lock().await;
            self.channel.consume(queue, consumer_tag, prefetch).await?
        };

        let io = Arc::clone(&self.io);
        Ok(stream
            .map(move |item| item.map(|d| d.serialized_by(Arc::clone(&io))))
            .boxed())
    }
}
