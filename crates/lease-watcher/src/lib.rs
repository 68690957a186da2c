//! Lease-coordinated change feed watcher
//!
//! Watches a change-tracked table and hands each changed row to an
//! [`ExecutionSink`] at least once, even with several watchers sharing the
//! table. Coordination happens entirely through a lease table next to the
//! watched table:
//!
//! - a scan selects eligible changes and leases them in one transaction
//! - a renewer keeps the leases of the batch in flight alive
//! - a successful delivery releases the leases and records the delivered
//!   version, so the same version is never offered again
//! - a failed delivery leaves the leases to expire, and after
//!   `max_dequeue_count` attempts the row is no longer offered
//!
//! Database specifics live behind the [`LeaseStore`] trait.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
mod renewer;
pub mod sink;
pub mod stats;
pub mod store;
pub mod testing;
pub mod watcher;

pub use config::{LeasePolicy, WatcherConfig};
pub use coordinator::CoordinatorState;
pub use error::WatcherError;
pub use model::{
    Batch, ChangeOperation, ChangeRow, LeaseState, PoisonedRow, PrimaryKeyColumn, RowKey,
    TableName, WatchedTable,
};
pub use sink::{DeliveryOutcome, ExecutionSink};
pub use stats::{StatsSnapshot, WatcherStats};
pub use store::LeaseStore;
pub use watcher::{Watcher, WatcherHandle};
