//! PostgreSQL-backed lease store.
//!
//! Each operation runs in its own transaction on a pooled connection. The scan
//! selects and leases in one transaction; the lease statement re-checks
//! eligibility per row, so a row leased by another watcher between the select
//! and the insert is simply missing from the result and dropped from the batch.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use lease_watcher::{
    Batch, LeasePolicy, LeaseStore, PoisonedRow, RowKey, TableName, WatchedTable, WatcherError,
};
use tokio_postgres::Client;
use tracing::debug;

use crate::query::{self, Statement};
use crate::row;
use crate::schema;

pub struct PostgresLeaseStore {
    pool: Pool,
    watched: WatchedTable,
}

impl PostgresLeaseStore {
    /// Discover the table's primary key, check change tracking is enabled, and
    /// create or verify the lease table.
    pub async fn open(pool: Pool, table: TableName) -> Result<Self, WatcherError> {
        let client = pool
            .get()
            .await
            .context("Failed to get PostgreSQL connection")
            .map_err(|e| WatcherError::startup(&table, e))?;
        let watched = prepare(&client, &table)
            .await
            .map_err(|e| WatcherError::startup(&table, e))?;

        Ok(Self { pool, watched })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn execute_in_transaction(&self, stmt: &Statement, action: &str) -> Result<u64> {
        let mut client = self
            .pool
            .get()
            .await
            .with_context(|| format!("Failed to get PostgreSQL connection to {action}"))?;
        let tx = client.transaction().await.context("Failed to begin transaction")?;
        let affected = tx
            .execute(stmt.sql.as_str(), &stmt.params())
            .await
            .with_context(|| format!("Failed to {action} on {}", self.watched.lease_table()))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {action}"))?;
        Ok(affected)
    }
}

async fn prepare(client: &Client, table: &TableName) -> Result<WatchedTable> {
    let watched = schema::load_watched_table(client, table).await?;
    schema::verify_change_tracking(client, &watched).await?;
    schema::ensure_lease_table(client, &watched).await?;
    Ok(watched)
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    fn watched_table(&self) -> &WatchedTable {
        &self.watched
    }

    async fn scan(&self, policy: &LeasePolicy) -> Result<Batch> {
        let table = self.watched.table().clone();
        let mut client = self
            .pool
            .get()
            .await
            .context("Failed to get PostgreSQL connection to scan")?;
        let tx = client.transaction().await.context("Failed to begin transaction")?;

        let select =
            query::select_eligible_changes(&self.watched, policy.batch_size, policy.max_dequeue_count);
        let candidates = tx
            .query(select.sql.as_str(), &select.params())
            .await
            .with_context(|| format!("Failed to select changes from {table}"))?
            .iter()
            .map(|r| row::change_row(&self.watched, r))
            .collect::<Result<Vec<_>>>()?;

        if candidates.is_empty() {
            tx.commit().await.context("Failed to commit scan")?;
            return Ok(Batch::empty(table));
        }

        let acquire = query::acquire_leases(
            &self.watched,
            &candidates,
            policy.lease_duration,
            policy.max_dequeue_count,
        );
        let mut acquired: HashMap<RowKey, u32> = tx
            .query(acquire.sql.as_str(), &acquire.params())
            .await
            .with_context(|| format!("Failed to acquire leases on {}", self.watched.lease_table()))?
            .iter()
            .map(|r| row::acquired_lease(&self.watched, r))
            .collect::<Result<_>>()?;
        tx.commit().await.context("Failed to commit scan")?;

        let selected = candidates.len();
        let rows: Vec<_> = candidates
            .into_iter()
            .filter_map(|mut change| {
                acquired.remove(&change.key).map(|attempt| {
                    change.attempt = attempt;
                    change
                })
            })
            .collect();
        if rows.len() < selected {
            debug!(
                table = %table,
                selected,
                leased = rows.len(),
                "Some rows were leased by another watcher"
            );
        }

        Ok(Batch::new(table, rows))
    }

    async fn renew(&self, keys: &[RowKey], lease_duration: Duration) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let stmt = query::renew_leases(&self.watched, keys, lease_duration);
        self.execute_in_transaction(&stmt, "renew leases").await
    }

    async fn release(&self, batch: &Batch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let stmt = query::release_leases(&self.watched, batch.rows());
        self.execute_in_transaction(&stmt, "release leases").await
    }

    async fn poisoned_rows(&self, max_dequeue_count: u32) -> Result<Vec<PoisonedRow>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get PostgreSQL connection")?;
        let stmt = query::select_poisoned_rows(&self.watched, max_dequeue_count);
        client
            .query(stmt.sql.as_str(), &stmt.params())
            .await
            .with_context(|| format!("Failed to query poisoned rows of {}", self.watched.table()))?
            .iter()
            .map(|r| row::poisoned_row(&self.watched, r))
            .collect()
    }
}
