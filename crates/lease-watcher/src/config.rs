//! Watcher configuration.

use std::time::Duration;

use crate::error::WatcherError;
use crate::model::TableName;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;
pub const DEFAULT_MAX_LEASE_RENEWALS: u32 = 5;
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 1;

/// Configuration for one watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Watched table, `table` or `schema.table`
    pub table: String,

    /// Maximum number of rows leased per scan (default: 10)
    pub batch_size: usize,

    /// How long an acquired or renewed lease lasts (default: 30 seconds)
    pub lease_duration: Duration,

    /// Time between scans (default: 5 seconds)
    pub poll_interval: Duration,

    /// Time between lease renewals while a batch is in flight.
    /// Defaults to half the lease duration.
    pub renew_interval: Option<Duration>,

    /// Number of times a row may be leased without a successful release
    /// before it is left alone (default: 5)
    pub max_dequeue_count: u32,

    /// Renewals per batch after which the renewer stops extending its
    /// leases (default: 5)
    pub max_lease_renewals: u32,

    /// Consecutive sink invocations per batch before the batch is abandoned
    /// (default: 1)
    pub max_delivery_attempts: u32,
}

impl WatcherConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            renew_interval: None,
            max_dequeue_count: DEFAULT_MAX_DEQUEUE_COUNT,
            max_lease_renewals: DEFAULT_MAX_LEASE_RENEWALS,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }

    pub fn table_name(&self) -> Result<TableName, WatcherError> {
        TableName::parse(&self.table)
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval.unwrap_or(self.lease_duration / 2)
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            batch_size: self.batch_size,
            lease_duration: self.lease_duration,
            max_dequeue_count: self.max_dequeue_count,
        }
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        self.table_name()?;
        if self.batch_size == 0 {
            return Err(WatcherError::config("batch_size must be at least 1"));
        }
        if self.lease_duration.as_secs() == 0 {
            return Err(WatcherError::config(
                "lease_duration must be at least one second",
            ));
        }
        if self.lease_duration.subsec_nanos() != 0 {
            return Err(WatcherError::config(format!(
                "lease_duration ({:?}) must be a whole number of seconds",
                self.lease_duration
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(WatcherError::config("poll_interval must be positive"));
        }
        let renew_interval = self.renew_interval();
        if renew_interval.is_zero() || renew_interval >= self.lease_duration {
            return Err(WatcherError::config(format!(
                "renew_interval ({renew_interval:?}) must be positive and shorter than lease_duration ({:?})",
                self.lease_duration
            )));
        }
        if self.max_dequeue_count == 0 {
            return Err(WatcherError::config("max_dequeue_count must be at least 1"));
        }
        if self.max_delivery_attempts == 0 {
            return Err(WatcherError::config(
                "max_delivery_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Parameters a lease store needs to select and lease a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub batch_size: usize,
    pub lease_duration: Duration,
    pub max_dequeue_count: u32,
}

impl LeasePolicy {
    /// Lease duration in whole seconds, the resolution leases are stored at.
    pub fn lease_secs(&self) -> i64 {
        lease_secs(self.lease_duration)
    }
}

pub fn lease_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// `duration` truncated to the whole seconds a lease is stored with.
pub fn stored_lease_duration(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}
