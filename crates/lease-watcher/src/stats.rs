//! Counters describing what a watcher has done so far.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WatcherStats {
    scans: AtomicU64,
    scan_failures: AtomicU64,
    rows_leased: AtomicU64,
    batches_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    batches_abandoned: AtomicU64,
    release_failures: AtomicU64,
    renewals: AtomicU64,
    renewal_failures: AtomicU64,
    rows_poisoned: AtomicU64,
}

/// Point-in-time copy of [`WatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scans: u64,
    pub scan_failures: u64,
    pub rows_leased: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub batches_abandoned: u64,
    pub release_failures: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub rows_poisoned: u64,
}

impl WatcherStats {
    pub(crate) fn record_scan(&self, rows: usize) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.rows_leased.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_scan_failure(&self) {
        self.scan_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.batches_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poisoned(&self, rows: usize) {
        self.rows_poisoned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_release_failure(&self) {
        self.release_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            rows_leased: self.rows_leased.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            batches_abandoned: self.batches_abandoned.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            rows_poisoned: self.rows_poisoned.load(Ordering::Relaxed),
        }
    }
}
