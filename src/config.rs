//! Command-line configuration for the watcher.

pub mod duration;

use clap::Args;
use lease_watcher::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_DELIVERY_ATTEMPTS, DEFAULT_MAX_DEQUEUE_COUNT,
    DEFAULT_MAX_LEASE_RENEWALS,
};
use lease_watcher::{WatcherConfig, WatcherError};
use lease_watcher_postgresql::DEFAULT_POOL_SIZE;

use self::duration::parse_duration;

#[derive(Args, Clone, Debug)]
pub struct ConnectionOpts {
    /// PostgreSQL connection string
    #[arg(long, env = "LEASE_WATCH_CONNECTION_STRING")]
    pub connection_string: Option<String>,

    /// Maximum number of pooled connections
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE, env = "LEASE_WATCH_POOL_SIZE")]
    pub pool_size: usize,
}

impl ConnectionOpts {
    pub fn connection_string(&self) -> Result<&str, WatcherError> {
        self.connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                WatcherError::config(
                    "missing connection string (--connection-string or LEASE_WATCH_CONNECTION_STRING)",
                )
            })
    }
}

#[derive(Args, Clone, Debug)]
pub struct TableOpts {
    /// Table to watch, as `table` or `schema.table`
    #[arg(long, env = "LEASE_WATCH_TABLE")]
    pub table: String,
}

#[derive(Args, Clone, Debug)]
pub struct WatchOpts {
    #[command(flatten)]
    pub table: TableOpts,

    /// Maximum rows leased per scan
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "LEASE_WATCH_BATCH_SIZE")]
    pub batch_size: usize,

    /// Lease duration (e.g. "30s", "2m")
    #[arg(long, default_value = "30s", env = "LEASE_WATCH_LEASE_DURATION")]
    pub lease_duration: String,

    /// Time between scans (e.g. "5s", "500ms")
    #[arg(long, default_value = "5s", env = "LEASE_WATCH_POLL_INTERVAL")]
    pub poll_interval: String,

    /// Time between lease renewals; defaults to half the lease duration
    #[arg(long, env = "LEASE_WATCH_RENEW_INTERVAL")]
    pub renew_interval: Option<String>,

    /// Leases without a successful release before a row is left alone
    #[arg(long, default_value_t = DEFAULT_MAX_DEQUEUE_COUNT, env = "LEASE_WATCH_MAX_DEQUEUE_COUNT")]
    pub max_dequeue_count: u32,

    /// Renewals per batch before its leases are allowed to lapse
    #[arg(long, default_value_t = DEFAULT_MAX_LEASE_RENEWALS, env = "LEASE_WATCH_MAX_LEASE_RENEWALS")]
    pub max_lease_renewals: u32,

    /// Sink invocations per batch before it is abandoned
    #[arg(long, default_value_t = DEFAULT_MAX_DELIVERY_ATTEMPTS, env = "LEASE_WATCH_MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: u32,
}

impl WatchOpts {
    pub fn to_config(&self) -> Result<WatcherConfig, WatcherError> {
        let duration = |name: &str, value: &str| {
            parse_duration(value).map_err(|e| WatcherError::config(format!("{name}: {e:#}")))
        };

        let mut config = WatcherConfig::new(self.table.table.clone());
        config.batch_size = self.batch_size;
        config.lease_duration = duration("lease-duration", &self.lease_duration)?;
        config.poll_interval = duration("poll-interval", &self.poll_interval)?;
        config.renew_interval = self
            .renew_interval
            .as_deref()
            .map(|value| duration("renew-interval", value))
            .transpose()?;
        config.max_dequeue_count = self.max_dequeue_count;
        config.max_lease_renewals = self.max_lease_renewals;
        config.max_delivery_attempts = self.max_delivery_attempts;
        config.validate()?;
        Ok(config)
    }
}
