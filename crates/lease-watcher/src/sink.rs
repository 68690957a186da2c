//! Execution sink contract.

use async_trait::async_trait;

use crate::model::Batch;

/// Result of handing a batch to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Succeeded,
    Failed,
}

/// Consumer of leased batches.
///
/// Delivery is at-least-once: a batch may be handed over again after a
/// failure, an expired lease or a crash, so implementations must tolerate
/// seeing the same row version more than once. Returning an error is treated
/// the same as returning [`DeliveryOutcome::Failed`].
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn deliver(&self, batch: &Batch) -> anyhow::Result<DeliveryOutcome>;
}
