//! SQL builders for the watched table, its change tracking table and its
//! lease table.
//!
//! Builders are pure: they take the discovered table shape and return a
//! [`Statement`] holding SQL text plus bound parameters, so they can be tested
//! without a database. Identifiers are always quoted. Primary key values are
//! bound as text and cast to the column type on the server.

use std::time::Duration;

use lease_watcher::config::lease_secs;
use lease_watcher::{ChangeRow, RowKey, TableName, WatchedTable};
use tokio_postgres::types::ToSql;

/// Schema holding change tracking tables and the version sequence.
pub const CHANGE_TRACKING_SCHEMA: &str = "change_tracking";

/// A bound parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    BigInt(i64),
}

impl SqlValue {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlValue::Text(value) => value as &(dyn ToSql + Sync),
            SqlValue::BigInt(value) => value as &(dyn ToSql + Sync),
        }
    }
}

/// SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlValue::as_sql).collect()
    }
}

#[derive(Default)]
struct Params(Vec<SqlValue>);

impl Params {
    fn bigint(&mut self, value: i64) -> String {
        self.0.push(SqlValue::BigInt(value));
        format!("${}::bigint", self.0.len())
    }

    fn text(&mut self, value: &str) -> String {
        self.0.push(SqlValue::Text(value.to_string()));
        format!("${}::text", self.0.len())
    }

    fn key_value(&mut self, value: &str, data_type: &str) -> String {
        let placeholder = self.text(value);
        format!("CAST({placeholder} AS {data_type})")
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified_name(table: &TableName) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

/// Change tracking table for `table`: `change_tracking."<schema>.<table>"`.
pub fn change_tracking_table(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(&format!("{}.{}", table.schema, table.name))
    )
}

fn key_columns(watched: &WatchedTable) -> Vec<String> {
    watched
        .primary_key()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect()
}

/// `a."k1" = b."k1" AND a."k2" = b."k2"`
fn join_on(watched: &WatchedTable, left: &str, right: &str) -> String {
    key_columns(watched)
        .iter()
        .map(|c| format!("{left}.{c} = {right}.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn select_key_text(watched: &WatchedTable, alias: &str) -> String {
    key_columns(watched)
        .iter()
        .map(|c| format!("{alias}.{c}::text"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_tuple(params: &mut Params, watched: &WatchedTable, key: &RowKey) -> Vec<String> {
    watched
        .primary_key()
        .iter()
        .zip(key.values())
        .map(|(column, value)| params.key_value(value, &column.data_type))
        .collect()
}

/// Primary key columns of a table, in key order, with their full type names.
/// Returns no rows when the table does not exist or has no primary key.
pub fn select_primary_keys(table: &TableName) -> Statement {
    let mut params = Params::default();
    let regclass = params.text(&qualified_name(table));
    Statement {
        sql: format!(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = to_regclass({regclass}) AND i.indisprimary \
             ORDER BY array_position(i.indkey::int2[], a.attnum)"
        ),
        params: params.0,
    }
}

/// Whether a relation exists, checked through `to_regclass`.
pub fn relation_exists(qualified: &str) -> Statement {
    let mut params = Params::default();
    let regclass = params.text(qualified);
    Statement {
        sql: format!("SELECT to_regclass({regclass}) IS NOT NULL"),
        params: params.0,
    }
}

/// Create the lease table with the same primary key as the watched table.
pub fn create_lease_table(watched: &WatchedTable) -> Statement {
    let mut columns: Vec<String> = watched
        .primary_key()
        .iter()
        .map(|c| format!("{} {} NOT NULL", quote_ident(&c.name), c.data_type))
        .collect();
    columns.push("lease_expiration_time timestamptz".to_string());
    columns.push("dequeue_count integer NOT NULL DEFAULT 0".to_string());
    columns.push("version_number bigint".to_string());
    columns.push(format!("PRIMARY KEY ({})", key_columns(watched).join(", ")));

    Statement {
        sql: format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            qualified_name(&watched.lease_table()),
            columns.join(", ")
        ),
        params: Vec::new(),
    }
}

/// Select up to `batch_size` changes that are not delivered at their current
/// version, not under an unexpired lease and below the dequeue ceiling, in
/// ascending change version order.
///
/// Result columns: key columns as text, change version, operation code,
/// lease expiration, dequeue count, delivered version, and the current row as
/// JSON (NULL for rows that no longer exist).
pub fn select_eligible_changes(
    watched: &WatchedTable,
    batch_size: usize,
    max_dequeue_count: u32,
) -> Statement {
    let mut params = Params::default();
    let max_dequeue = params.bigint(i64::from(max_dequeue_count));
    let limit = params.bigint(i64::try_from(batch_size).unwrap_or(i64::MAX));
    let first_key = quote_ident(&watched.primary_key()[0].name);

    Statement {
        sql: format!(
            "SELECT {keys}, c.sys_change_version, c.sys_change_operation::text, \
             l.lease_expiration_time, l.dequeue_count, l.version_number, \
             CASE WHEN t.{first_key} IS NULL THEN NULL ELSE to_jsonb(t) END \
             FROM {ct} AS c \
             LEFT JOIN {lease} AS l ON {lease_join} \
             LEFT JOIN {table} AS t ON {table_join} \
             WHERE (l.version_number IS NULL OR l.version_number < c.sys_change_version) \
             AND (l.lease_expiration_time IS NULL OR l.lease_expiration_time < now()) \
             AND (l.dequeue_count IS NULL OR l.dequeue_count < {max_dequeue}) \
             ORDER BY c.sys_change_version ASC \
             LIMIT {limit}",
            keys = select_key_text(watched, "c"),
            ct = change_tracking_table(watched.table()),
            lease = qualified_name(&watched.lease_table()),
            lease_join = join_on(watched, "l", "c"),
            table = qualified_name(watched.table()),
            table_join = join_on(watched, "t", "c"),
        ),
        params: params.0,
    }
}

/// Lease every row in `rows` that is still eligible, inserting lease rows
/// where none exist. Returns the key (as text) and new dequeue count of each
/// row actually leased; rows leased concurrently by another watcher are
/// absent from the result.
pub fn acquire_leases(
    watched: &WatchedTable,
    rows: &[ChangeRow],
    lease_duration: Duration,
    max_dequeue_count: u32,
) -> Statement {
    let mut params = Params::default();
    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut tuple = key_tuple(&mut params, watched, &row.key);
            tuple.push(params.bigint(row.version));
            format!("({})", tuple.join(", "))
        })
        .collect();
    let lease_secs = params.bigint(lease_secs(lease_duration));
    let max_dequeue = params.bigint(i64::from(max_dequeue_count));

    let columns = key_columns(watched);
    let candidate_columns = columns.join(", ");
    let candidate_match = columns
        .iter()
        .map(|c| format!("v.{c} = l.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    Statement {
        sql: format!(
            "WITH candidates ({candidate_columns}, change_version) AS (VALUES {values}) \
             INSERT INTO {lease} AS l ({candidate_columns}, lease_expiration_time, dequeue_count, version_number) \
             SELECT {candidate_columns}, now() + {lease_secs} * interval '1 second', 1, NULL::bigint FROM candidates \
             ON CONFLICT ({candidate_columns}) DO UPDATE \
             SET lease_expiration_time = EXCLUDED.lease_expiration_time, \
             dequeue_count = l.dequeue_count + 1 \
             WHERE (l.lease_expiration_time IS NULL OR l.lease_expiration_time < now()) \
             AND l.dequeue_count < {max_dequeue} \
             AND (l.version_number IS NULL OR l.version_number < \
             (SELECT v.change_version FROM candidates AS v WHERE {candidate_match})) \
             RETURNING {returned}, l.dequeue_count",
            values = values.join(", "),
            lease = qualified_name(&watched.lease_table()),
            returned = select_key_text(watched, "l"),
        ),
        params: params.0,
    }
}

/// Single-row form of [`acquire_leases`].
pub fn acquire_lease(
    watched: &WatchedTable,
    row: &ChangeRow,
    lease_duration: Duration,
    max_dequeue_count: u32,
) -> Statement {
    acquire_leases(
        watched,
        std::slice::from_ref(row),
        lease_duration,
        max_dequeue_count,
    )
}

/// Push the expiration of every still-held lease in `keys` out to
/// `now() + lease_duration`.
pub fn renew_leases(watched: &WatchedTable, keys: &[RowKey], lease_duration: Duration) -> Statement {
    let mut params = Params::default();
    let lease_secs = params.bigint(lease_secs(lease_duration));
    let values: Vec<String> = keys
        .iter()
        .map(|key| format!("({})", key_tuple(&mut params, watched, key).join(", ")))
        .collect();

    Statement {
        sql: format!(
            "UPDATE {lease} AS l \
             SET lease_expiration_time = now() + {lease_secs} * interval '1 second' \
             FROM (VALUES {values}) AS k ({columns}) \
             WHERE {join} AND l.lease_expiration_time IS NOT NULL",
            lease = qualified_name(&watched.lease_table()),
            values = values.join(", "),
            columns = key_columns(watched).join(", "),
            join = join_on(watched, "l", "k"),
        ),
        params: params.0,
    }
}

/// Single-row form of [`renew_leases`].
pub fn renew_lease(watched: &WatchedTable, key: &RowKey, lease_duration: Duration) -> Statement {
    renew_leases(watched, std::slice::from_ref(key), lease_duration)
}

/// Clear the leases of delivered rows, reset their dequeue counts and record
/// the delivered versions. Recorded versions never move backwards, which
/// makes the statement safe to repeat.
pub fn release_leases(watched: &WatchedTable, rows: &[ChangeRow]) -> Statement {
    let mut params = Params::default();
    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut tuple = key_tuple(&mut params, watched, &row.key);
            tuple.push(params.bigint(row.version));
            format!("({})", tuple.join(", "))
        })
        .collect();

    Statement {
        sql: format!(
            "UPDATE {lease} AS l \
             SET lease_expiration_time = NULL, dequeue_count = 0, \
             version_number = GREATEST(l.version_number, v.change_version) \
             FROM (VALUES {values}) AS v ({columns}, change_version) \
             WHERE {join}",
            lease = qualified_name(&watched.lease_table()),
            values = values.join(", "),
            columns = key_columns(watched).join(", "),
            join = join_on(watched, "l", "v"),
        ),
        params: params.0,
    }
}

/// Single-row form of [`release_leases`].
pub fn release_lease(watched: &WatchedTable, row: &ChangeRow) -> Statement {
    release_leases(watched, std::slice::from_ref(row))
}

/// Lease rows whose dequeue count reached the ceiling.
pub fn select_poisoned_rows(watched: &WatchedTable, max_dequeue_count: u32) -> Statement {
    let mut params = Params::default();
    let max_dequeue = params.bigint(i64::from(max_dequeue_count));
    let keys = key_columns(watched);

    Statement {
        sql: format!(
            "SELECT {returned}, l.dequeue_count, l.version_number \
             FROM {lease} AS l \
             WHERE l.dequeue_count >= {max_dequeue} \
             ORDER BY {order}",
            returned = select_key_text(watched, "l"),
            lease = qualified_name(&watched.lease_table()),
            order = keys
                .iter()
                .map(|c| format!("l.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        params: params.0,
    }
}
