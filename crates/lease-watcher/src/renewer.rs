//! Periodic lease renewal for the batch currently in flight.
//!
//! The renewer runs as its own task so that a slow sink never delays lease
//! extension. It learns about the in-flight batch through a `watch` channel
//! published by the coordinator, and takes the renew gate for every renewal;
//! the coordinator takes the same gate while releasing, so a renewal can never
//! land after the leases it targets were cleared.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::RowKey;
use crate::stats::WatcherStats;
use crate::store::LeaseStore;

/// Keys of the batch the coordinator is currently delivering.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub batch_id: u64,
    pub keys: Arc<[RowKey]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewOutcome {
    Idle,
    Renewed(u64),
    LimitReached,
    Failed,
}

pub(crate) struct LeaseRenewer<L> {
    store: Arc<L>,
    in_flight: watch::Receiver<Option<InFlight>>,
    gate: Arc<Mutex<()>>,
    renew_interval: Duration,
    lease_duration: Duration,
    max_renewals: u32,
    stats: Arc<WatcherStats>,
    // (batch id, successful renewals of it)
    renewed: Option<(u64, u32)>,
}

impl<L: LeaseStore> LeaseRenewer<L> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<L>,
        in_flight: watch::Receiver<Option<InFlight>>,
        gate: Arc<Mutex<()>>,
        renew_interval: Duration,
        lease_duration: Duration,
        max_renewals: u32,
        stats: Arc<WatcherStats>,
    ) -> Self {
        Self {
            store,
            in_flight,
            gate,
            renew_interval,
            lease_duration,
            max_renewals,
            stats,
            renewed: None,
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.renew_interval, self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.renew_once().await;
        }

        debug!("Lease renewer stopped");
    }

    pub(crate) async fn renew_once(&mut self) -> RenewOutcome {
        let _gate = self.gate.lock().await;

        let current = self.in_flight.borrow().clone();
        let Some(in_flight) = current else {
            self.renewed = None;
            return RenewOutcome::Idle;
        };

        let count = match self.renewed {
            Some((batch_id, count)) if batch_id == in_flight.batch_id => count,
            _ => 0,
        };
        if count >= self.max_renewals {
            if count == self.max_renewals {
                warn!(
                    batch_id = in_flight.batch_id,
                    rows = in_flight.keys.len(),
                    max_renewals = self.max_renewals,
                    "Lease renewal limit reached, leases will lapse and rows may be redelivered"
                );
                self.renewed = Some((in_flight.batch_id, count + 1));
            }
            return RenewOutcome::LimitReached;
        }
        self.renewed = Some((in_flight.batch_id, count));

        match self.store.renew(&in_flight.keys, self.lease_duration).await {
            Ok(renewed) => {
                self.renewed = Some((in_flight.batch_id, count + 1));
                self.stats.record_renewal();
                debug!(
                    batch_id = in_flight.batch_id,
                    renewed,
                    renewal = count + 1,
                    "Renewed leases"
                );
                RenewOutcome::Renewed(renewed)
            }
            Err(e) => {
                self.stats.record_renewal_failure();
                warn!(
                    batch_id = in_flight.batch_id,
                    error = %format!("{e:#}"),
                    "Failed to renew leases, will retry on next tick"
                );
                RenewOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeasePolicy;
    use crate::testing::MemoryLeaseStore;

    fn policy() -> LeasePolicy {
        LeasePolicy {
            batch_size: 10,
            lease_duration: Duration::from_secs(30),
            max_dequeue_count: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_once_extends_in_flight_leases_until_limit() {
        let store = Arc::new(MemoryLeaseStore::single_key("public.items"));
        store.upsert(["1"], serde_json::json!({"id": 1}));
        let batch = store.scan(&policy()).await.unwrap();

        let (tx, rx) = watch::channel(None);
        let stats = Arc::new(WatcherStats::default());
        let mut renewer = LeaseRenewer::new(
            store.clone(),
            rx,
            Arc::new(Mutex::new(())),
            Duration::from_secs(10),
            Duration::from_secs(30),
            2,
            stats.clone(),
        );

        assert_eq!(renewer.renew_once().await, RenewOutcome::Idle);

        tx.send_replace(Some(InFlight {
            batch_id: 1,
            keys: batch.keys().into(),
        }));
        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(1));
        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(1));
        assert_eq!(renewer.renew_once().await, RenewOutcome::LimitReached);
        assert_eq!(renewer.renew_once().await, RenewOutcome::LimitReached);
        assert_eq!(stats.snapshot().renewals, 2);

        // A new batch starts a fresh renewal budget.
        tx.send_replace(Some(InFlight {
            batch_id: 2,
            keys: batch.keys().into(),
        }));
        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_does_not_count_toward_limit() {
        let store = Arc::new(MemoryLeaseStore::single_key("public.items"));
        store.upsert(["1"], serde_json::json!({"id": 1}));
        let batch = store.scan(&policy()).await.unwrap();

        let (_tx, rx) = watch::channel(Some(InFlight {
            batch_id: 1,
            keys: batch.keys().into(),
        }));
        let stats = Arc::new(WatcherStats::default());
        let mut renewer = LeaseRenewer::new(
            store.clone(),
            rx,
            Arc::new(Mutex::new(())),
            Duration::from_secs(10),
            Duration::from_secs(30),
            2,
            stats.clone(),
        );

        store.fail_next_renewals(1);
        assert_eq!(renewer.renew_once().await, RenewOutcome::Failed);
        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(1));
        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(1));
        assert_eq!(renewer.renew_once().await, RenewOutcome::LimitReached);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.renewals, 2);
        assert_eq!(snapshot.renewal_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_skips_released_rows() {
        let store = Arc::new(MemoryLeaseStore::single_key("public.items"));
        store.upsert(["1"], serde_json::json!({"id": 1}));
        let batch = store.scan(&policy()).await.unwrap();
        store.release(&batch).await.unwrap();

        let (_tx, rx) = watch::channel(Some(InFlight {
            batch_id: 7,
            keys: batch.keys().into(),
        }));
        let mut renewer = LeaseRenewer::new(
            store.clone(),
            rx,
            Arc::new(Mutex::new(())),
            Duration::from_secs(10),
            Duration::from_secs(30),
            5,
            Arc::new(WatcherStats::default()),
        );

        assert_eq!(renewer.renew_once().await, RenewOutcome::Renewed(0));
        let lease = store.lease(&batch.keys()[0]).unwrap();
        assert_eq!(lease.expires_at, None);
    }
}
