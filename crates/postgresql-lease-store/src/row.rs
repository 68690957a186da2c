//! Decoding result rows of the lease store queries.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lease_watcher::{ChangeOperation, ChangeRow, LeaseState, PoisonedRow, RowKey, WatchedTable};
use tokio_postgres::Row;

fn read_key(row: &Row, key_len: usize) -> Result<RowKey> {
    let values = (0..key_len)
        .map(|i| row.try_get::<_, String>(i))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode primary key")?;
    Ok(RowKey::new(values))
}

fn dequeue_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Decode a row of [`crate::query::select_eligible_changes`]. The attempt
/// number is filled in once the lease is acquired.
pub fn change_row(watched: &WatchedTable, row: &Row) -> Result<ChangeRow> {
    let k = watched.primary_key().len();
    let key = read_key(row, k)?;

    let version: i64 = row.try_get(k).context("Failed to decode change version")?;
    let code: String = row.try_get(k + 1).context("Failed to decode change operation")?;
    let operation = ChangeOperation::from_code(&code)
        .ok_or_else(|| anyhow!("Unknown change operation '{code}' for key {key}"))?;

    let expires_at: Option<DateTime<Utc>> = row.try_get(k + 2)?;
    let dequeue: Option<i32> = row.try_get(k + 3)?;
    let version_number: Option<i64> = row.try_get(k + 4)?;
    let lease = dequeue.map(|count| LeaseState {
        expires_at,
        dequeue_count: dequeue_count(count),
        version_number,
    });

    let columns = match row
        .try_get::<_, Option<serde_json::Value>>(k + 5)
        .context("Failed to decode row data")?
    {
        Some(serde_json::Value::Object(map)) => Some(map),
        Some(other) => {
            return Err(anyhow!(
                "Expected a JSON object for row {key}, found {other}"
            ))
        }
        None => None,
    };

    Ok(ChangeRow {
        key,
        version,
        operation,
        columns,
        lease,
        attempt: 0,
    })
}

/// Decode a row returned by [`crate::query::acquire_leases`].
pub fn acquired_lease(watched: &WatchedTable, row: &Row) -> Result<(RowKey, u32)> {
    let k = watched.primary_key().len();
    let key = read_key(row, k)?;
    let count: i32 = row.try_get(k).context("Failed to decode dequeue count")?;
    Ok((key, dequeue_count(count)))
}

/// Decode a row of [`crate::query::select_poisoned_rows`].
pub fn poisoned_row(watched: &WatchedTable, row: &Row) -> Result<PoisonedRow> {
    let k = watched.primary_key().len();
    Ok(PoisonedRow {
        key: read_key(row, k)?,
        dequeue_count: dequeue_count(row.try_get(k)?),
        version_number: row.try_get(k + 1)?,
    })
}
