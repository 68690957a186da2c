//! Lease store contract.
//!
//! A lease store owns the change-tracked table, its lease table and the
//! transactions that keep them consistent. The coordinator and renewer only
//! ever talk to the database through this trait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::LeasePolicy;
use crate::model::{Batch, PoisonedRow, RowKey, WatchedTable};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// The table this store watches, with its discovered primary key
    fn watched_table(&self) -> &WatchedTable;

    /// Select up to `policy.batch_size` eligible changes in ascending version
    /// order and lease them, atomically. Rows another watcher leased in the
    /// meantime are left out of the returned batch.
    async fn scan(&self, policy: &LeasePolicy) -> Result<Batch>;

    /// Extend the leases on `keys` that are still held. Returns the number of
    /// leases extended.
    async fn renew(&self, keys: &[RowKey], lease_duration: Duration) -> Result<u64>;

    /// Clear the leases of a delivered batch, reset its dequeue counts and
    /// record the delivered versions. Safe to repeat.
    async fn release(&self, batch: &Batch) -> Result<u64>;

    /// Rows whose dequeue count reached `max_dequeue_count`
    async fn poisoned_rows(&self, max_dequeue_count: u32) -> Result<Vec<PoisonedRow>>;
}
