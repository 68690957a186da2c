//! PostgreSQL lease store for lease-watcher
//!
//! Provides the [`PostgresLeaseStore`] implementation of
//! [`lease_watcher::LeaseStore`], the SQL builders it runs, and the
//! trigger-based change tracking the store reads from.
//!
//! For a watched table `<schema>.<table>` the store uses:
//!
//! - `change_tracking."<schema>.<table>"`: latest change version and
//!   operation per primary key, maintained by a trigger
//! - `"<schema>"."<table>_leases"`: lease expiration, dequeue count and last
//!   delivered version per primary key, created on first use

pub mod change_tracking;
pub mod client;
pub mod query;
mod row;
pub mod schema;
pub mod store;
pub mod testing;

pub use change_tracking::{disable_change_tracking, enable_change_tracking};
pub use client::{new_postgresql_client, new_postgresql_pool, DEFAULT_POOL_SIZE};
pub use store::PostgresLeaseStore;
