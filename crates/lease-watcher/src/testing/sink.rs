//! Recording sinks for exercising watchers in tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::model::{Batch, RowKey};
use crate::sink::{DeliveryOutcome, ExecutionSink};

/// Detects the same row being delivered by two sinks at once.
#[derive(Debug, Default)]
pub struct OverlapTracker {
    active: Mutex<HashSet<RowKey>>,
    overlaps: Mutex<Vec<RowKey>>,
}

impl OverlapTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, keys: &[RowKey]) {
        let mut active = lock(&self.active);
        for key in keys {
            if !active.insert(key.clone()) {
                lock(&self.overlaps).push(key.clone());
            }
        }
    }

    fn exit(&self, keys: &[RowKey]) {
        let mut active = lock(&self.active);
        for key in keys {
            active.remove(key);
        }
    }

    /// Keys that were seen in flight twice at the same time.
    pub fn overlaps(&self) -> Vec<RowKey> {
        lock(&self.overlaps).clone()
    }
}

struct ActiveGuard<'a> {
    tracker: Option<&'a OverlapTracker>,
    keys: Vec<RowKey>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker {
            tracker.exit(&self.keys);
        }
    }
}

/// One call to [`RecordingSink::deliver`].
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub keys: Vec<RowKey>,
    pub versions: Vec<i64>,
    pub attempts: Vec<u32>,
    pub succeeded: bool,
    pub finished_at: Instant,
}

#[derive(Debug, Clone)]
enum Response {
    Outcome(DeliveryOutcome),
    Error(String),
}

/// Sink that records every batch it sees and answers from a script.
#[derive(Debug)]
pub struct RecordingSink {
    script: Mutex<VecDeque<Response>>,
    fallback: Response,
    delay: Duration,
    tracker: Option<Arc<OverlapTracker>>,
    deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl RecordingSink {
    fn with_fallback(fallback: Response) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            tracker: None,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Sink that accepts every batch.
    pub fn succeeding() -> Self {
        Self::with_fallback(Response::Outcome(DeliveryOutcome::Succeeded))
    }

    /// Sink that reports failure for every batch.
    pub fn failing() -> Self {
        Self::with_fallback(Response::Outcome(DeliveryOutcome::Failed))
    }

    /// Sink that returns an error for every batch.
    pub fn erroring(message: &str) -> Self {
        Self::with_fallback(Response::Error(message.to_string()))
    }

    /// Answer the next calls with `outcomes`, in order, before falling back.
    pub fn then(self, outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        lock(&self.script).extend(outcomes.into_iter().map(Response::Outcome));
        self
    }

    /// Spend `delay` inside every delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<OverlapTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        lock(&self.deliveries).clone()
    }

    /// Keys of every batch that was accepted, in delivery order.
    pub fn delivered_keys(&self) -> Vec<RowKey> {
        lock(&self.deliveries)
            .iter()
            .filter(|d| d.succeeded)
            .flat_map(|d| d.keys.iter().cloned())
            .collect()
    }

    /// Number of times `key` was handed to this sink.
    pub fn offers(&self, key: &RowKey) -> usize {
        lock(&self.deliveries)
            .iter()
            .filter(|d| d.keys.contains(key))
            .count()
    }
}

#[async_trait]
impl ExecutionSink for RecordingSink {
    async fn deliver(&self, batch: &Batch) -> Result<DeliveryOutcome> {
        let keys = batch.keys();
        let _active = ActiveGuard {
            tracker: self.tracker.as_deref(),
            keys: keys.clone(),
        };
        if let Some(tracker) = &self.tracker {
            tracker.enter(&keys);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let response = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let succeeded = matches!(response, Response::Outcome(DeliveryOutcome::Succeeded));
        lock(&self.deliveries).push(RecordedDelivery {
            keys,
            versions: batch.iter().map(|r| r.version).collect(),
            attempts: batch.iter().map(|r| r.attempt).collect(),
            succeeded,
            finished_at: Instant::now(),
        });

        match response {
            Response::Outcome(outcome) => Ok(outcome),
            Response::Error(message) => Err(anyhow!(message)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
