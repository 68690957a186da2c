//! Trigger-based change tracking.
//!
//! Each tracked table gets a companion table in the `change_tracking` schema
//! holding one row per changed primary key: the latest change version, the
//! version at which the key was created, and the net operation. Versions come
//! from a single sequence shared by all tracked tables. An AFTER row trigger
//! keeps the companion table current:
//!
//! - insert then update is still an insert
//! - delete then insert becomes an update
//! - any change followed by a delete is a delete
//! - an update that changes the primary key is a delete of the old key and
//!   an insert of the new one
//!
//! Enabling and disabling tracking are operator actions; watchers only read
//! the companion table.

use anyhow::{Context, Result};
use lease_watcher::{TableName, WatchedTable};
use tracing::info;

use crate::query::{change_tracking_table, qualified_name, quote_ident, CHANGE_TRACKING_SCHEMA};

const VERSION_SEQUENCE: &str = "version_seq";

fn version_sequence() -> String {
    format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(VERSION_SEQUENCE)
    )
}

fn capture_function(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_ident(CHANGE_TRACKING_SCHEMA),
        quote_ident(&format!("{}.{}_capture", table.schema, table.name))
    )
}

fn trigger_name(table: &TableName) -> String {
    quote_ident(&format!("{}_change_tracking", table.name))
}

fn record_change_sql(ct: &str, columns: &str, values: &str, creation: &str, op: char, on_conflict_op: &str) -> String {
    format!(
        "INSERT INTO {ct} AS c ({columns}, sys_change_version, sys_change_creation_version, sys_change_operation)
            VALUES ({values}, _ct_version, {creation}, '{op}')
            ON CONFLICT ({columns}) DO UPDATE
            SET sys_change_version = _ct_version, sys_change_operation = {on_conflict_op};"
    )
}

/// DDL enabling change tracking on `watched`. Safe to run again; the trigger
/// and function are replaced, existing tracked changes are kept.
pub fn enable_change_tracking_sql(watched: &WatchedTable) -> String {
    let table = watched.table();
    let ct = change_tracking_table(table);
    let key_names: Vec<String> = watched
        .primary_key()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect();
    let columns = key_names.join(", ");
    let key_definitions: Vec<String> = watched
        .primary_key()
        .iter()
        .map(|c| format!("{} {} NOT NULL", quote_ident(&c.name), c.data_type))
        .collect();
    let old_key = key_names
        .iter()
        .map(|c| format!("OLD.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let new_key = key_names
        .iter()
        .map(|c| format!("NEW.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let key_changed = format!("(TG_OP = 'UPDATE' AND ROW({old_key}) IS DISTINCT FROM ROW({new_key}))");

    let record_delete = record_change_sql(&ct, &columns, &old_key, "NULL", 'D', "'D'");
    let record_insert = record_change_sql(
        &ct,
        &columns,
        &new_key,
        "_ct_version",
        'I',
        "CASE WHEN c.sys_change_operation = 'D' THEN 'U' ELSE c.sys_change_operation END",
    );
    let record_update = record_change_sql(
        &ct,
        &columns,
        &new_key,
        "NULL",
        'U',
        "CASE WHEN c.sys_change_operation = 'I' THEN 'I' ELSE 'U' END",
    );

    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema};
CREATE SEQUENCE IF NOT EXISTS {sequence};
CREATE TABLE IF NOT EXISTS {ct} (
    {key_definitions},
    sys_change_version bigint NOT NULL,
    sys_change_creation_version bigint,
    sys_change_operation char(1) NOT NULL,
    PRIMARY KEY ({columns})
);
CREATE INDEX IF NOT EXISTS {version_index} ON {ct} (sys_change_version);
CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql AS $ct$
DECLARE
    _ct_version bigint := nextval('{sequence_literal}');
BEGIN
    IF TG_OP = 'DELETE' OR {key_changed} THEN
        {record_delete}
    END IF;
    IF TG_OP = 'INSERT' OR {key_changed} THEN
        {record_insert}
    ELSIF TG_OP = 'UPDATE' THEN
        {record_update}
    END IF;
    RETURN NULL;
END;
$ct$;
DROP TRIGGER IF EXISTS {trigger} ON {table};
CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table}
    FOR EACH ROW EXECUTE FUNCTION {function}();",
        schema = quote_ident(CHANGE_TRACKING_SCHEMA),
        sequence = version_sequence(),
        sequence_literal = version_sequence().replace('\'', "''"),
        key_definitions = key_definitions.join(",\n    "),
        version_index = quote_ident(&format!("{}.{}_version_idx", table.schema, table.name)),
        function = capture_function(table),
        trigger = trigger_name(table),
        table = qualified_name(table),
    )
}

/// DDL removing change tracking from `table`, including its tracked changes.
/// The shared sequence and schema are left in place.
pub fn disable_change_tracking_sql(table: &TableName) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table};
DROP FUNCTION IF EXISTS {function}();
DROP TABLE IF EXISTS {ct};",
        trigger = trigger_name(table),
        table = qualified_name(table),
        function = capture_function(table),
        ct = change_tracking_table(table),
    )
}

/// Enable change tracking on `watched` in one transaction.
pub async fn enable_change_tracking(
    client: &mut tokio_postgres::Client,
    watched: &WatchedTable,
) -> Result<()> {
    let tx = client
        .transaction()
        .await
        .context("Failed to begin transaction")?;
    tx.batch_execute(&enable_change_tracking_sql(watched))
        .await
        .with_context(|| format!("Failed to enable change tracking on {}", watched.table()))?;
    tx.commit().await.context("Failed to commit change tracking setup")?;

    info!(table = %watched.table(), "Enabled change tracking");
    Ok(())
}

/// Disable change tracking on `table` in one transaction.
pub async fn disable_change_tracking(
    client: &mut tokio_postgres::Client,
    table: &TableName,
) -> Result<()> {
    let tx = client
        .transaction()
        .await
        .context("Failed to begin transaction")?;
    tx.batch_execute(&disable_change_tracking_sql(table))
        .await
        .with_context(|| format!("Failed to disable change tracking on {table}"))?;
    tx.commit().await.context("Failed to commit change tracking removal")?;

    info!(table = %table, "Disabled change tracking");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lease_watcher::PrimaryKeyColumn;

    fn products() -> WatchedTable {
        WatchedTable::new(
            TableName::new("public", "products"),
            vec![PrimaryKeyColumn::new("id", "integer")],
        )
        .unwrap()
    }

    #[test]
    fn test_enable_creates_companion_table_and_trigger() {
        let sql = enable_change_tracking_sql(&products());
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS \"change_tracking\";"));
        assert!(sql.contains("CREATE SEQUENCE IF NOT EXISTS \"change_tracking\".\"version_seq\";"));
        assert!(sql.contains(
            "CREATE TABLE IF NOT EXISTS \"change_tracking\".\"public.products\" (\n    \"id\" integer NOT NULL,"
        ));
        assert!(sql.contains("nextval('\"change_tracking\".\"version_seq\"')"));
        assert!(sql.contains(
            "CREATE TRIGGER \"products_change_tracking\" AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"products\""
        ));
        assert!(sql.contains("EXECUTE FUNCTION \"change_tracking\".\"public.products_capture\"()"));
    }

    #[test]
    fn test_enable_records_key_changes_as_delete_and_insert() {
        let sql = enable_change_tracking_sql(&products());
        assert!(sql.contains("ROW(OLD.\"id\") IS DISTINCT FROM ROW(NEW.\"id\")"));
        assert!(sql.contains("VALUES (OLD.\"id\", _ct_version, NULL, 'D')"));
        assert!(sql.contains("VALUES (NEW.\"id\", _ct_version, _ct_version, 'I')"));
        assert!(sql.contains("CASE WHEN c.sys_change_operation = 'D' THEN 'U'"));
    }

    #[test]
    fn test_disable_drops_trigger_function_and_table() {
        let sql = disable_change_tracking_sql(&TableName::new("public", "products"));
        assert_eq!(
            sql,
            "DROP TRIGGER IF EXISTS \"products_change_tracking\" ON \"public\".\"products\";
DROP FUNCTION IF EXISTS \"change_tracking\".\"public.products_capture\"();
DROP TABLE IF EXISTS \"change_tracking\".\"public.products\";"
        );
    }
}
