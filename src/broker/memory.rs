// ============================================================================
// In-process Broker
// ============================================================================
//
// A single-node stand-in for a RabbitMQ cluster. Every "node URL" dials the
// same set of queues. Behaviors mirrored from the real broker:
//
// - priority queues: higher priority first, FIFO within a priority, message
//   priority capped at the queue's x-max-priority
// - redeclaring a queue with different arguments is a channel error
// - publishing to a missing queue through the default exchange drops silently
// - per-consumer prefetch window
// - nack(requeue) and channel loss put unacked messages back with
//   `redelivered = true`
//
// `sever()` drops every open channel at once, as a node failure would, and
// fires the failure notifiers registered at dial time.
//
// ============================================================================

use async_trait::async_trait;
use dispatch_error::ConnectionError;
use futures_util::stream;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::connection::FailureNotifier;
use super::{BrokerChannel, BrokerDialer, Delivery, DeliveryAcker, DeliveryStream, MessageProperties};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    priority: u8,
    message_id: Option<String>,
}

#[derive(Debug)]
struct Ready {
    seq: u64,
    redelivered: bool,
    message: StoredMessage,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // Max-heap: highest priority first, then lowest sequence number
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Unacked {
    seq: u64,
    consumer_id: u64,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    max_priority: u8,
    ready: BinaryHeap<Ready>,
    unacked: HashMap<u64, Unacked>,
    next_seq: u64,
    published: u64,
}

impl QueueState {
    fn push(&mut self, mut message: StoredMessage) {
        message.priority = message.priority.min(self.max_priority);
        self.next_seq += 1;
        self.published += 1;
        self.ready.push(Ready {
            seq: self.next_seq,
            redelivered: false,
            message,
        });
    }

    fn requeue(&mut self, entry: Unacked) {
        self.ready.push(Ready {
            seq: entry.seq,
            redelivered: true,
            message: entry.message,
        });
    }
}

#[derive(Default)]
struct Inner {
    epoch: u64,
    queues: HashMap<String, QueueState>,
    unreachable: HashSet<String>,
    notifiers: Vec<(u64, FailureNotifier)>,
    dial_attempts: usize,
    next_channel_id: u64,
    next_consumer_id: u64,
    next_tag: u64,
}

/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> Arc<dyn BrokerDialer> {
        Arc::new(MemoryDialer {
            broker: self.clone(),
        })
    }

    /// Make a node URL refuse (or accept again) new connections.
    pub fn set_reachable(&self, url: &str, reachable: bool) {
        let mut inner = self.lock();
        if reachable {
            inner.unreachable.remove(url);
        } else {
            inner.unreachable.insert(url.to_string());
        }
    }

    /// Drop every open channel, requeue their unacked messages and fire
    /// the failure notifiers.
    pub fn sever(&self) {
        let notifiers = {
            let mut inner = self.lock();
            let old_epoch = inner.epoch;
            inner.epoch += 1;
            for queue in inner.queues.values_mut() {
                let tags: Vec<u64> = queue.unacked.keys().copied().collect();
                for tag in tags {
                    if let Some(entry) = queue.unacked.remove(&tag) {
                        queue.requeue(entry);
                    }
                }
            }
            let (fire, keep): (Vec<_>, Vec<_>) = inner
                .notifiers
                .drain(..)
                .partition(|(epoch, _)| *epoch == old_epoch);
            inner.notifiers = keep;
            fire
        };

        for (_, notifier) in notifiers {
            notifier.notify("connection closed by broker");
        }
        self.changed.notify_waiters();
    }

    pub fn dial_attempts(&self) -> usize {
        self.lock().dial_attempts
    }

    pub fn max_priority(&self, queue: &str) -> Option<u8> {
        self.lock().queues.get(queue).map(|q| q.max_priority)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn published_count(&self, queue: &str) -> u64 {
        self.lock().queues.get(queue).map_or(0, |q| q.published)
    }

    /// Put a raw body on a queue without going through a channel.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>, priority: u8) {
        {
            let mut inner = self.lock();
            let q = inner.queues.entry(queue.to_string()).or_insert_with(|| QueueState {
                max_priority: dispatch_config::constants::MAX_PRIORITY,
                ..Default::default()
            });
            q.push(StoredMessage {
                body: body.into(),
                priority,
                message_id: None,
            });
        }
        self.changed.notify_waiters();
    }

    /// Remove and return all ready messages in delivery order as `(priority, body)`.
    pub fn drain(&self, queue: &str) -> Vec<(u8, Vec<u8>)> {
        let mut inner = self.lock();
        let Some(q) = inner.queues.get_mut(queue) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(q.ready.len());
        while let Some(ready) = q.ready.pop() {
            out.push((ready.message.priority, ready.message.body));
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct MemoryDialer {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerDialer for MemoryDialer {
    async fn dial(&self, url: &str, on_failure: FailureNotifier) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let mut inner = self.broker.lock();
        inner.dial_attempts += 1;
        if inner.unreachable.contains(url) {
            return Err(ConnectionError::Dial {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let epoch = inner.epoch;
        inner.notifiers.push((epoch, on_failure));
        inner.next_channel_id += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            channel_id: inner.next_channel_id,
            epoch,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    channel_id: u64,
    epoch: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn check_open(&self, inner: &Inner) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) || inner.epoch != self.epoch {
            return Err(ConnectionError::Channel("channel closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_priority_queue(&self, name: &str, max_priority: u8) -> Result<(), ConnectionError> {
        let mut inner = self.broker.lock();
        self.check_open(&inner)?;

        let queue = inner.queues.entry(name.to_string()).or_insert_with(|| QueueState {
            max_priority,
            ..Default::default()
        });
        if queue.max_priority != max_priority {
            return Err(ConnectionError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'x-max-priority' for queue '{}'",
                name
            )));
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], properties: &MessageProperties) -> Result<(), ConnectionError> {
        {
            let mut inner = self.broker.lock();
            self.check_open(&inner)?;

            if let Some(q) = inner.queues.get_mut(queue) {
                q.push(StoredMessage {
                    body: body.to_vec(),
                    priority: properties.priority.value(),
                    message_id: properties.message_id.clone(),
                });
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, ConnectionError> {
        let consumer_id = {
            let mut inner = self.broker.lock();
            self.check_open(&inner)?;
            if !inner.queues.contains_key(queue) {
                return Err(ConnectionError::Channel(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }
            inner.next_consumer_id += 1;
            inner.next_consumer_id
        };

        let consumer = MemoryConsumer {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            consumer_id,
            channel_id: self.channel_id,
            epoch: self.epoch,
            prefetch: prefetch as usize,
            closed: Arc::clone(&self.closed),
            finished: false,
        };

        Ok(Box::pin(stream::unfold(consumer, |mut consumer| async move {
            if consumer.finished {
                return None;
            }
            let item = consumer.next_delivery().await;
            if item.is_err() {
                consumer.finished = true;
            }
            Some((item, consumer))
        })))
    }

    fn is_open(&self) -> bool {
        let inner = self.broker.lock();
        self.check_open(&inner).is_ok()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut inner = self.broker.lock();
            for queue in inner.queues.values_mut() {
                let tags: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel_id == self.channel_id)
                    .map(|(tag, _)| *tag)
                    .collect();
                for tag in tags {
                    if let Some(entry) = queue.unacked.remove(&tag) {
                        queue.requeue(entry);
                    }
                }
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    queue: String,
    consumer_id: u64,
    channel_id: u64,
    epoch: u64,
    prefetch: usize,
    closed: Arc<AtomicBool>,
    finished: bool,
}

impl MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, ConnectionError> {
        loop {
            let notified = self.broker.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                return result;
            }
            notified.await;
        }
    }

    fn try_take(&self) -> Option<Result<Delivery, ConnectionError>> {
        let mut inner = self.broker.lock();
        if self.closed.load(Ordering::SeqCst) || inner.epoch != self.epoch {
            return Some(Err(ConnectionError::Channel(
                "consumer cancelled: channel closed".to_string(),
            )));
        }

        let tag = inner.next_tag + 1;
        let queue = inner.queues.get_mut(&self.queue)?;

        let in_flight = queue
            .unacked
            .values()
            .filter(|u| u.consumer_id == self.consumer_id)
            .count();
        if self.prefetch > 0 && in_flight >= self.prefetch {
            return None;
        }

        let ready = queue.ready.pop()?;
        queue.unacked.insert(
            tag,
            Unacked {
                seq: ready.seq,
                consumer_id: self.consumer_id,
                channel_id: self.channel_id,
                message: ready.message.clone(),
            },
        );
        inner.next_tag = tag;

        let acker = MemoryAcker {
            broker: self.broker.clone(),
            queue: self.queue.clone(),
            tag,
            epoch: self.epoch,
            closed: Arc::clone(&self.closed),
        };
        Some(Ok(Delivery::new(
            ready.message.body,
            Some(ready.message.priority),
            ready.message.message_id,
            ready.redelivered,
            Arc::new(acker),
        )))
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    epoch: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), ConnectionError> {
        {
            let mut inner = self.broker.lock();
            if self.closed.load(Ordering::SeqCst) || inner.epoch != self.epoch {
                return Err(ConnectionError::ChannelNotOpen);
            }
            let queue = inner
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| ConnectionError::Channel(format!("queue '{}' deleted", self.queue)))?;
            let entry = queue.unacked.remove(&self.tag).ok_or_else(|| {
                ConnectionError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
            })?;
            if requeue == Some(true) {
                queue.requeue(entry);
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), ConnectionError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn open(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        broker
            .dialer()
            .dial("mem://a", FailureNotifier::detached())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let broker = MemoryBroker::new();
        let ch = open(&broker).await;
        ch.declare_priority_queue("q", 4).await.unwrap();

        for (p, body) in [(1u8, "a"), (4, "b"), (1, "c"), (9, "d"), (0, "e")] {
            let props = MessageProperties::persistent(Priority::from(p));
            ch.publish("q", body.as_bytes(), &props).await.unwrap();
        }

        let order: Vec<(u8, String)> = broker
            .drain("q")
            .into_iter()
            .map(|(p, b)| (p, String::from_utf8(b).unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                (4, "b".to_string()),
                (4, "d".to_string()),
                (1, "a".to_string()),
                (1, "c".to_string()),
                (0, "e".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_redeclare_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        let ch = open(&broker).await;
        ch.declare_priority_queue("q", 4).await.unwrap();
        ch.declare_priority_queue("q", 4).await.unwrap();
        assert!(ch.declare_priority_queue("q", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        let ch = open(&broker).await;
        ch.declare_priority_queue("q", 4).await.unwrap();
        broker.inject("q", b"x".to_vec(), 2);

        let mut stream = ch.consume("q", "c1", 10).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        let ch = open(&broker).await;
        ch.declare_priority_queue("q", 4).await.unwrap();
        for _ in 0..3 {
            broker.inject("q", b"x".to_vec(), 0);
        }

        let mut stream = ch.consume("q", "c1", 2).await.unwrap();
        let a = stream.next().await.unwrap().unwrap();
        let _b = stream.next().await.unwrap().unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err());

        a.ack().await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sever_requeues_and_ends_consumers() {
        let broker = MemoryBroker::new();
        let ch = open(&broker).await;
        ch.declare_priority_queue("q", 4).await.unwrap();
        broker.inject("q", b"x".to_vec(), 0);

        let mut stream = ch.consume("q", "c1", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.sever();

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert_eq!(delivery.ack().await, Err(ConnectionError::ChannelNotOpen));
        assert!(!ch.is_open());
        assert_eq!(broker.ready_count("q"), 1);
    }
}
