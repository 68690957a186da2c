//! Table and row model shared by lease stores, the coordinator and sinks.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WatcherError;

/// Schema assumed when a table name carries no schema qualifier.
pub const DEFAULT_SCHEMA: &str = "public";

/// Schema-qualified name of a user table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `table` or `schema.table`. Surrounding double quotes on either
    /// part are stripped.
    pub fn parse(input: &str) -> Result<Self, WatcherError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(WatcherError::config("table name must not be empty"));
        }

        let parts: Vec<&str> = input.split('.').collect();
        let (schema, name) = match parts.as_slice() {
            [name] => (DEFAULT_SCHEMA, *name),
            [schema, name] => (*schema, *name),
            _ => {
                return Err(WatcherError::config(format!(
                    "table name '{input}' must be 'table' or 'schema.table'"
                )))
            }
        };

        let schema = unquote(schema);
        let name = unquote(name);
        if schema.is_empty() || name.is_empty() {
            return Err(WatcherError::config(format!(
                "table name '{input}' has an empty schema or table part"
            )));
        }

        Ok(Self::new(schema, name))
    }

    /// Name of the lease table paired with this table.
    pub fn lease_table(&self) -> TableName {
        TableName::new(self.schema.clone(), format!("{}_leases", self.name))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

fn unquote(part: &str) -> &str {
    let part = part.trim();
    part.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(part)
}

/// One primary key column, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub name: String,
    /// Database type name, as usable in a cast expression
    pub data_type: String,
}

impl PrimaryKeyColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A user table together with its ordered primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTable {
    table: TableName,
    primary_key: Vec<PrimaryKeyColumn>,
}

impl WatchedTable {
    pub fn new(table: TableName, primary_key: Vec<PrimaryKeyColumn>) -> Result<Self, WatcherError> {
        if primary_key.is_empty() {
            return Err(WatcherError::config(format!(
                "table '{table}' has no primary key"
            )));
        }
        Ok(Self { table, primary_key })
    }

    pub(crate) fn single_column(table: TableName, column: PrimaryKeyColumn) -> Self {
        Self {
            table,
            primary_key: vec![column],
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn primary_key(&self) -> &[PrimaryKeyColumn] {
        &self.primary_key
    }

    pub fn lease_table(&self) -> TableName {
        self.table.lease_table()
    }

    /// Build a key for this table, checking the arity.
    pub fn key<I, S>(&self, values: I) -> Result<RowKey, WatcherError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = RowKey::new(values);
        if key.len() != self.primary_key.len() {
            return Err(WatcherError::config(format!(
                "key {key} has {} values but table '{}' has {} primary key columns",
                key.len(),
                self.table,
                self.primary_key.len()
            )));
        }
        Ok(key)
    }
}

/// Primary key of a row, as the text form of each key column in key order.
///
/// Keys are immutable and cheap to clone so they can be shared between the
/// coordinator and the lease renewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(Arc<[String]>);

impl RowKey {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RowKey(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Kind of change recorded for a row since it was last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Decode the single-letter code used by change tracking (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(ChangeOperation::Insert),
            "U" => Some(ChangeOperation::Update),
            "D" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "I",
            ChangeOperation::Update => "U",
            ChangeOperation::Delete => "D",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "Insert",
            ChangeOperation::Update => "Update",
            ChangeOperation::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// Lease bookkeeping for a row as it was before the current acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseState {
    pub expires_at: Option<DateTime<Utc>>,
    pub dequeue_count: u32,
    /// Highest change version successfully delivered for the row
    pub version_number: Option<i64>,
}

/// A changed row, leased to this watcher for the duration of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub key: RowKey,
    pub version: i64,
    pub operation: ChangeOperation,
    /// Current column values; `None` when the row no longer exists.
    pub columns: Option<serde_json::Map<String, serde_json::Value>>,
    pub lease: Option<LeaseState>,
    /// Dequeue count after this acquisition, starting at 1.
    pub attempt: u32,
}

impl ChangeRow {
    /// True once the row has used its last permitted delivery attempt.
    pub fn is_final_attempt(&self, max_dequeue_count: u32) -> bool {
        self.attempt >= max_dequeue_count
    }
}

/// Ordered set of leased rows handed to a sink together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    table: TableName,
    rows: Vec<ChangeRow>,
}

impl Batch {
    pub fn new(table: TableName, rows: Vec<ChangeRow>) -> Self {
        Self { table, rows }
    }

    pub fn empty(table: TableName) -> Self {
        Self::new(table, Vec::new())
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn rows(&self) -> &[ChangeRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<RowKey> {
        self.rows.iter().map(|row| row.key.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeRow> {
        self.rows.iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a ChangeRow;
    type IntoIter = std::slice::Iter<'a, ChangeRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// A row whose dequeue count reached the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonedRow {
    pub key: RowKey,
    pub dequeue_count: u32,
    pub version_number: Option<i64>,
}
