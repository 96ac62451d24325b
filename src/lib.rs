// ============================================================================
// SMS Dispatch
// ============================================================================
//
// Priority SMS dispatch pipeline:
//
//   publisher -> broker queue (x-max-priority 4) -> ConsumptionLoop
//                   lock -> classify -> rate limit -> carrier -> ack/nack
//                   telemetry points -> time-series store
//
// Module map:
// - broker     - connection manager, priority publisher, management stats
// - classifier - MSISDN prefix -> operator
// - lock       - per-message idempotency lock in the shared store
// - rate_limit - fixed-window counters in the shared store
// - store      - shared key-value store seam (Redis / in-memory)
// - telemetry  - buffered best-effort delivery events
// - worker     - per-delivery processing and the bounded consumer pool
//
// ============================================================================

pub mod broker;
pub mod classifier;
pub mod health;
pub mod lock;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod worker;

pub use broker::{BrokerConnectionManager, ConnectionState, PriorityPublisher, StatisticsCollector};
pub use classifier::CarrierClassifier;
pub use lock::MessageLock;
pub use rate_limit::{DistributedRateLimiter, RatePolicy};
pub use store::SharedStore;
pub use telemetry::TelemetryRecorder;
pub use types::{MessageType, Operator, Priority, QueueMessage};
pub use worker::{ConsumptionLoop, WorkerContext, WorkerSettings};
