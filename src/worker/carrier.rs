// ============================================================================
// Carrier Submission
// ============================================================================
//
// The carrier-facing submission path sits behind `CarrierGateway`. The only
// implementation shipped is `SimulatedCarrier`, which stands in for the
// operator SMSC: a random latency and a configurable failure probability.
//
// ============================================================================

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::types::{Operator, QueueMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierOutcome {
    Delivered,
    Failed(String),
}

impl CarrierOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, CarrierOutcome::Delivered)
    }
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    /// Submit one message to the operator. Never retried by the caller.
    async fn submit(&self, message: &QueueMessage, operator: Operator) -> CarrierOutcome;
}

#[derive(Debug, Clone)]
pub struct SimulatedCarrier {
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
}

impl SimulatedCarrier {
    pub fn new(min_latency: Duration, max_latency: Duration, failure_rate: f64) -> Self {
        let (min_latency, max_latency) = if min_latency <= max_latency {
            (min_latency, max_latency)
        } else {
            (max_latency, min_latency)
        };
        Self {
            min_latency,
            max_latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    /// Always succeeds, no delay.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0)
    }
}

#[async_trait]
impl CarrierGateway for SimulatedCarrier {
    async fn submit(&self, _message: &QueueMessage, operator: Operator) -> CarrierOutcome {
        // ThreadRng is not Send; draw everything before the first await
        let (latency, failed) = {
            let mut rng = rand::thread_rng();
            let min = self.min_latency.as_millis() as u64;
            let max = self.max_latency.as_millis() as u64;
            let latency = Duration::from_millis(rng.gen_range(min..=max));
            (latency, rng.gen_bool(self.failure_rate))
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if failed {
            CarrierOutcome::Failed(format!("{} gateway rejected submission", operator))
        } else {
            CarrierOutcome::Delivered
        }
    }
}
