//! Batch delivery coordinator.
//!
//! One task owns the whole scan, deliver and release cycle, so at most one
//! batch per watcher is ever in flight. State changes are published on a
//! `watch` channel for the host to observe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::LeasePolicy;
use crate::model::{Batch, TableName};
use crate::renewer::InFlight;
use crate::sink::{DeliveryOutcome, ExecutionSink};
use crate::stats::WatcherStats;
use crate::store::LeaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Idle,
    Scanning,
    Delivering,
    ReleasingLeases,
}

impl CoordinatorState {
    pub fn can_transition_to(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Idle, ReleasingLeases)
                | (Scanning, Idle)
                | (Scanning, Delivering)
                | (Delivering, ReleasingLeases)
                | (Delivering, Idle)
                | (ReleasingLeases, Idle)
        )
    }
}

/// What one tick of the coordinator did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    NoChanges,
    ScanFailed,
    Delivered { rows: usize },
    /// Delivered, but the leases could not be released yet
    ReleaseFailed { rows: usize },
    /// A release carried over from an earlier tick failed again
    ReleasePending,
    Abandoned { rows: usize, poisoned: usize },
    Cancelled { poisoned: usize },
}

enum Delivery {
    Succeeded,
    Failed,
    Cancelled,
}

pub(crate) struct Coordinator<L, S> {
    store: Arc<L>,
    sink: Arc<S>,
    table: TableName,
    policy: LeasePolicy,
    poll_interval: Duration,
    max_delivery_attempts: u32,
    state: watch::Sender<CoordinatorState>,
    in_flight: watch::Sender<Option<InFlight>>,
    gate: Arc<Mutex<()>>,
    stats: Arc<WatcherStats>,
    pending_release: Option<Batch>,
    next_batch_id: u64,
}

impl<L: LeaseStore, S: ExecutionSink> Coordinator<L, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<L>,
        sink: Arc<S>,
        policy: LeasePolicy,
        poll_interval: Duration,
        max_delivery_attempts: u32,
        state: watch::Sender<CoordinatorState>,
        in_flight: watch::Sender<Option<InFlight>>,
        gate: Arc<Mutex<()>>,
        stats: Arc<WatcherStats>,
    ) -> Self {
        let table = store.watched_table().table().clone();
        Self {
            store,
            sink,
            table,
            policy,
            poll_interval,
            max_delivery_attempts,
            state,
            in_flight,
            gate,
            stats,
            pending_release: None,
            next_batch_id: 0,
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = self.poll_once(&cancel).await;
            trace!(table = %self.table, ?outcome, "Coordinator tick finished");
        }

        if let Some(batch) = &self.pending_release {
            warn!(
                table = %self.table,
                rows = batch.len(),
                "Stopping with an unreleased batch, its rows will be redelivered after lease expiry"
            );
        }
        debug!(table = %self.table, "Coordinator stopped");
    }

    pub(crate) async fn poll_once(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        if let Some(batch) = self.pending_release.take() {
            self.transition(CoordinatorState::ReleasingLeases);
            let released = self.release(&batch).await;
            self.transition(CoordinatorState::Idle);
            if !released {
                self.pending_release = Some(batch);
                return CycleOutcome::ReleasePending;
            }
        }

        self.transition(CoordinatorState::Scanning);
        let batch = match self.store.scan(&self.policy).await {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_scan_failure();
                warn!(
                    table = %self.table,
                    error = %format!("{e:#}"),
                    "Failed to scan for changes, will retry on next tick"
                );
                self.transition(CoordinatorState::Idle);
                return CycleOutcome::ScanFailed;
            }
        };
        self.stats.record_scan(batch.len());

        if batch.is_empty() {
            self.transition(CoordinatorState::Idle);
            return CycleOutcome::NoChanges;
        }

        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        debug!(table = %self.table, batch_id, rows = batch.len(), "Leased batch");

        self.transition(CoordinatorState::Delivering);
        self.in_flight.send_replace(Some(InFlight {
            batch_id,
            keys: batch.keys().into(),
        }));

        let rows = batch.len();
        match self.deliver(&batch, batch_id, cancel).await {
            Delivery::Succeeded => {
                self.stats.record_delivered();
                self.transition(CoordinatorState::ReleasingLeases);
                let released = self.release(&batch).await;
                self.transition(CoordinatorState::Idle);
                if released {
                    CycleOutcome::Delivered { rows }
                } else {
                    self.pending_release = Some(batch);
                    CycleOutcome::ReleaseFailed { rows }
                }
            }
            Delivery::Failed => {
                let poisoned = self.abandon(&batch, batch_id).await;
                self.transition(CoordinatorState::Idle);
                CycleOutcome::Abandoned { rows, poisoned }
            }
            Delivery::Cancelled => {
                self.clear_in_flight().await;
                let poisoned = self.log_final_attempts(&batch);
                self.transition(CoordinatorState::Idle);
                info!(
                    table = %self.table,
                    batch_id,
                    rows,
                    poisoned,
                    "Delivery cancelled by shutdown, leases left to expire"
                );
                CycleOutcome::Cancelled { poisoned }
            }
        }
    }

    async fn deliver(&self, batch: &Batch, batch_id: u64, cancel: &CancellationToken) -> Delivery {
        for attempt in 1..=self.max_delivery_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Delivery::Cancelled,
                result = self.sink.deliver(batch) => result,
            };

            match result {
                Ok(DeliveryOutcome::Succeeded) => return Delivery::Succeeded,
                Ok(DeliveryOutcome::Failed) => {
                    self.stats.record_delivery_failure();
                    warn!(
                        table = %self.table,
                        batch_id,
                        attempt,
                        max_attempts = self.max_delivery_attempts,
                        "Sink reported batch failure"
                    );
                }
                Err(e) => {
                    self.stats.record_delivery_failure();
                    warn!(
                        table = %self.table,
                        batch_id,
                        attempt,
                        max_attempts = self.max_delivery_attempts,
                        error = %format!("{e:#}"),
                        "Sink failed to process batch"
                    );
                }
            }
        }
        Delivery::Failed
    }

    /// Release a delivered batch. The in-flight keys stay published until the
    /// release commits, so the renewer keeps the leases alive across retries.
    async fn release(&self, batch: &Batch) -> bool {
        let _gate = self.gate.lock().await;
        match self.store.release(batch).await {
            Ok(released) => {
                self.in_flight.send_replace(None);
                debug!(table = %self.table, rows = batch.len(), released, "Released leases");
                true
            }
            Err(e) => {
                self.stats.record_release_failure();
                warn!(
                    table = %self.table,
                    rows = batch.len(),
                    error = %format!("{e:#}"),
                    "Failed to release leases, will retry on next tick"
                );
                false
            }
        }
    }

    /// Give up on a batch. Leases are left to expire so the rows are offered
    /// again, until their dequeue count reaches the ceiling.
    async fn abandon(&self, batch: &Batch, batch_id: u64) -> usize {
        self.clear_in_flight().await;

        let poisoned = self.log_final_attempts(batch);
        self.stats.record_abandoned();
        warn!(
            table = %self.table,
            batch_id,
            rows = batch.len(),
            poisoned,
            "Abandoned batch, leases left to expire"
        );
        poisoned
    }

    /// Warn about every row of an unreleased batch that was on its last
    /// permitted lease, and count them as poisoned.
    fn log_final_attempts(&self, batch: &Batch) -> usize {
        let mut poisoned = 0;
        for row in batch {
            if row.is_final_attempt(self.policy.max_dequeue_count) {
                poisoned += 1;
                warn!(
                    table = %self.table,
                    key = %row.key,
                    version = row.version,
                    dequeue_count = row.attempt,
                    "Row reached the dequeue limit and will not be offered again"
                );
            }
        }
        self.stats.record_poisoned(poisoned);
        poisoned
    }

    async fn clear_in_flight(&self) {
        let _gate = self.gate.lock().await;
        self.in_flight.send_replace(None);
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        debug_assert!(
            previous.can_transition_to(next),
            "invalid coordinator transition {previous:?} -> {next:?}"
        );
        trace!(table = %self.table, from = ?previous, to = ?next, "Coordinator state changed");
    }
}
