//! Watcher lifecycle: start the coordinator and renewer tasks, stop them.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WatcherConfig;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::WatcherError;
use crate::model::TableName;
use crate::renewer::LeaseRenewer;
use crate::sink::ExecutionSink;
use crate::stats::{StatsSnapshot, WatcherStats};
use crate::store::LeaseStore;

pub struct Watcher;

impl Watcher {
    /// Validate `config` and start watching the table behind `store`.
    ///
    /// The first scan runs immediately, later ones every `poll_interval`.
    pub async fn start<L, S>(
        store: Arc<L>,
        sink: Arc<S>,
        config: WatcherConfig,
    ) -> Result<WatcherHandle, WatcherError>
    where
        L: LeaseStore + 'static,
        S: ExecutionSink + 'static,
    {
        config.validate()?;
        let table = store.watched_table().table().clone();
        let configured = config.table_name()?;
        if configured != table {
            return Err(WatcherError::config(format!(
                "configured table '{configured}' does not match the store's table '{table}'"
            )));
        }

        match store.poisoned_rows(config.max_dequeue_count).await {
            Ok(poisoned) if !poisoned.is_empty() => warn!(
                table = %table,
                count = poisoned.len(),
                max_dequeue_count = config.max_dequeue_count,
                "Table has rows that reached the dequeue limit and are no longer offered"
            ),
            Ok(_) => {}
            Err(e) => warn!(
                table = %table,
                error = %format!("{e:#}"),
                "Failed to count poisoned rows"
            ),
        }

        let cancel = CancellationToken::new();
        let stats = Arc::new(WatcherStats::default());
        let gate = Arc::new(Mutex::new(()));
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let (in_flight_tx, in_flight_rx) = watch::channel(None);

        let renewer = LeaseRenewer::new(
            store.clone(),
            in_flight_rx,
            gate.clone(),
            config.renew_interval(),
            config.lease_duration,
            config.max_lease_renewals,
            stats.clone(),
        );
        let coordinator = Coordinator::new(
            store,
            sink,
            config.lease_policy(),
            config.poll_interval,
            config.max_delivery_attempts,
            state_tx,
            in_flight_tx,
            gate,
            stats.clone(),
        );

        let renewer_task = tokio::spawn(renewer.run(cancel.clone()));
        let coordinator_task = tokio::spawn(coordinator.run(cancel.clone()));

        info!(
            table = %table,
            batch_size = config.batch_size,
            lease_secs = config.lease_duration.as_secs(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Started watcher"
        );

        Ok(WatcherHandle {
            table,
            cancel,
            state: state_rx,
            stats,
            coordinator: coordinator_task,
            renewer: renewer_task,
        })
    }
}

/// Handle to a running watcher.
pub struct WatcherHandle {
    table: TableName,
    cancel: CancellationToken,
    state: watch::Receiver<CoordinatorState>,
    stats: Arc<WatcherStats>,
    coordinator: JoinHandle<()>,
    renewer: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Receiver that observes every coordinator state change.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Token that stops the watcher when cancelled, for wiring into a
    /// host's own shutdown handling.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both tasks and wait for them to finish. No new scan starts after
    /// this is called; a delivery in progress is abandoned and its leases
    /// expire on their own.
    pub async fn stop(self) -> Result<StatsSnapshot, WatcherError> {
        self.cancel.cancel();
        let coordinator = self.coordinator.await;
        let renewer = self.renewer.await;
        coordinator?;
        renewer?;

        let stats = self.stats.snapshot();
        info!(
            table = %self.table,
            scans = stats.scans,
            batches_delivered = stats.batches_delivered,
            "Stopped watcher"
        );
        Ok(stats)
    }
}
