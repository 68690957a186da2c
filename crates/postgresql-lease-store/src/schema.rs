//! Primary key discovery and lease table setup.

use anyhow::{bail, Context, Result};
use lease_watcher::{PrimaryKeyColumn, TableName, WatchedTable};
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::query::{self, Statement};

/// Primary key columns of `table` in key order. Empty when the table does not
/// exist or has no primary key.
pub async fn discover_primary_key(
    client: &Client,
    table: &TableName,
) -> Result<Vec<PrimaryKeyColumn>> {
    let stmt = query::select_primary_keys(table);
    let rows = client
        .query(stmt.sql.as_str(), &stmt.params())
        .await
        .with_context(|| format!("Failed to query primary key of {table}"))?;

    rows.iter()
        .map(|row| -> Result<PrimaryKeyColumn, tokio_postgres::Error> {
            Ok(PrimaryKeyColumn::new(
                row.try_get::<_, String>(0)?,
                row.try_get::<_, String>(1)?,
            ))
        })
        .collect::<Result<Vec<_>, tokio_postgres::Error>>()
        .with_context(|| format!("Failed to decode primary key of {table}"))
}

/// Discover the watched table's primary key.
pub async fn load_watched_table(client: &Client, table: &TableName) -> Result<WatchedTable> {
    let primary_key = discover_primary_key(client, table).await?;
    if primary_key.is_empty() {
        bail!("Table {table} does not exist or has no primary key");
    }
    debug!(table = %table, columns = ?primary_key, "Discovered primary key");
    Ok(WatchedTable::new(table.clone(), primary_key)?)
}

pub async fn relation_exists(client: &Client, qualified: &str) -> Result<bool> {
    let stmt = query::relation_exists(qualified);
    let row = client
        .query_one(stmt.sql.as_str(), &stmt.params())
        .await
        .with_context(|| format!("Failed to look up relation {qualified}"))?;
    Ok(row.try_get(0)?)
}

/// Fail unless change tracking was enabled for `watched`.
pub async fn verify_change_tracking(client: &Client, watched: &WatchedTable) -> Result<()> {
    let ct = query::change_tracking_table(watched.table());
    if !relation_exists(client, &ct).await? {
        bail!(
            "Change tracking is not enabled for {} (missing {ct})",
            watched.table()
        );
    }
    Ok(())
}

fn is_concurrent_create(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::UNIQUE_VIOLATION || *code == SqlState::DUPLICATE_TABLE
    )
}

async fn execute_ddl(client: &Client, stmt: &Statement) -> Result<(), tokio_postgres::Error> {
    client.execute(stmt.sql.as_str(), &stmt.params()).await.map(|_| ())
}

/// Create the lease table if needed, then check its primary key matches the
/// watched table's. Another watcher creating the table at the same moment is
/// not an error.
pub async fn ensure_lease_table(client: &Client, watched: &WatchedTable) -> Result<()> {
    let lease_table = watched.lease_table();
    let stmt = query::create_lease_table(watched);
    match execute_ddl(client, &stmt).await {
        Ok(()) => {}
        Err(e) if is_concurrent_create(&e) => {
            debug!(table = %lease_table, "Lease table was created concurrently");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to create lease table {lease_table}"));
        }
    }

    let lease_key = discover_primary_key(client, &lease_table).await?;
    if lease_key != watched.primary_key() {
        bail!(
            "Lease table {lease_table} has primary key {} but {} has {}",
            describe_key(&lease_key),
            watched.table(),
            describe_key(watched.primary_key())
        );
    }

    info!(table = %lease_table, "Lease table ready");
    Ok(())
}

fn describe_key(columns: &[PrimaryKeyColumn]) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.data_type))
        .collect();
    format!("({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_key() {
        let key = vec![
            PrimaryKeyColumn::new("order_id", "bigint"),
            PrimaryKeyColumn::new("line", "integer"),
        ];
        assert_eq!(describe_key(&key), "(order_id bigint, line integer)");
    }
}
