//! In-memory lease store driven by the tokio clock.
//!
//! Every operation runs under one lock, which gives the same all-or-nothing
//! behaviour as a serializable transaction. Lease times use
//! [`tokio::time::Instant`], so tests can run with a paused clock and advance
//! through lease expiry without waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::config::{stored_lease_duration, LeasePolicy};
use crate::model::{
    Batch, ChangeOperation, ChangeRow, LeaseState, PoisonedRow, PrimaryKeyColumn, RowKey,
    TableName, WatchedTable, DEFAULT_SCHEMA,
};
use crate::store::LeaseStore;

#[derive(Debug, Clone)]
struct TrackedChange {
    version: i64,
    operation: ChangeOperation,
}

#[derive(Debug, Clone, Default)]
struct MemoryLease {
    expires_at: Option<Instant>,
    dequeue_count: u32,
    version_number: Option<i64>,
}

#[derive(Debug, Default)]
struct InjectedFailures {
    scans: u32,
    renewals: u32,
    releases: u32,
}

#[derive(Debug)]
struct MemoryState {
    last_version: i64,
    rows: HashMap<RowKey, Map<String, Value>>,
    changes: HashMap<RowKey, TrackedChange>,
    leases: HashMap<RowKey, MemoryLease>,
    failures: InjectedFailures,
}

/// Shared in-memory store. Clones share the same tables, so several watchers
/// can compete over one store.
#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    watched: WatchedTable,
    origin: (Instant, DateTime<Utc>),
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLeaseStore {
    pub fn new(watched: WatchedTable) -> Self {
        Self {
            watched,
            origin: (Instant::now(), Utc::now()),
            state: Arc::new(Mutex::new(MemoryState {
                last_version: 0,
                rows: HashMap::new(),
                changes: HashMap::new(),
                leases: HashMap::new(),
                failures: InjectedFailures::default(),
            })),
        }
    }

    /// Store for a table keyed by a single integer `id` column.
    pub fn single_key(table: &str) -> Self {
        let table = TableName::parse(table)
            .unwrap_or_else(|_| TableName::new(DEFAULT_SCHEMA, table.trim()));
        Self::new(WatchedTable::single_column(
            table,
            PrimaryKeyColumn::new("id", "integer"),
        ))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or update a row of the watched table, recording the change.
    /// Returns the change version assigned.
    pub fn upsert<I, S>(&self, key: I, columns: Value) -> i64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = RowKey::new(key);
        let columns = match columns {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut state = self.lock();
        let existed = state.rows.insert(key.clone(), columns).is_some();
        let operation = match (state.changes.get(&key).map(|c| c.operation), existed) {
            (Some(ChangeOperation::Insert), true) => ChangeOperation::Insert,
            (Some(ChangeOperation::Delete), false) => ChangeOperation::Update,
            (_, true) => ChangeOperation::Update,
            (_, false) => ChangeOperation::Insert,
        };
        record_change(&mut state, key, operation)
    }

    /// Delete a row of the watched table, recording the change.
    pub fn delete<I, S>(&self, key: I) -> i64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = RowKey::new(key);
        let mut state = self.lock();
        state.rows.remove(&key);
        record_change(&mut state, key, ChangeOperation::Delete)
    }

    /// Lease row for `key`, if one was ever written.
    pub fn lease(&self, key: &RowKey) -> Option<LeaseState> {
        let state = self.lock();
        state.leases.get(key).map(|lease| self.lease_state(lease))
    }

    /// Current change version for `key`.
    pub fn change_version(&self, key: &RowKey) -> Option<i64> {
        self.lock().changes.get(key).map(|c| c.version)
    }

    /// Keys that currently hold an unexpired lease.
    pub fn leased_keys(&self) -> Vec<RowKey> {
        let now = Instant::now();
        let state = self.lock();
        let mut keys: Vec<RowKey> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at.map_or(false, |t| t >= now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn fail_next_scans(&self, count: u32) {
        self.lock().failures.scans = count;
    }

    pub fn fail_next_renewals(&self, count: u32) {
        self.lock().failures.renewals = count;
    }

    pub fn fail_next_releases(&self, count: u32) {
        self.lock().failures.releases = count;
    }

    fn wall_clock(&self, at: Instant) -> DateTime<Utc> {
        let elapsed = at.saturating_duration_since(self.origin.0);
        self.origin.1 + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    fn lease_state(&self, lease: &MemoryLease) -> LeaseState {
        LeaseState {
            expires_at: lease.expires_at.map(|t| self.wall_clock(t)),
            dequeue_count: lease.dequeue_count,
            version_number: lease.version_number,
        }
    }
}

fn record_change(state: &mut MemoryState, key: RowKey, operation: ChangeOperation) -> i64 {
    state.last_version += 1;
    let version = state.last_version;
    state
        .changes
        .insert(key, TrackedChange { version, operation });
    version
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

fn is_eligible(lease: Option<&MemoryLease>, version: i64, now: Instant, max_dequeue: u32) -> bool {
    let Some(lease) = lease else {
        return true;
    };
    lease.version_number.map_or(true, |v| v < version)
        && lease.expires_at.map_or(true, |t| t < now)
        && lease.dequeue_count < max_dequeue
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn watched_table(&self) -> &WatchedTable {
        &self.watched
    }

    async fn scan(&self, policy: &LeasePolicy) -> Result<Batch> {
        let now = Instant::now();
        let mut state = self.lock();
        if take_failure(&mut state.failures.scans) {
            bail!("Injected scan failure");
        }

        let mut eligible: Vec<(RowKey, TrackedChange)> = state
            .changes
            .iter()
            .filter(|(key, change)| {
                is_eligible(
                    state.leases.get(*key),
                    change.version,
                    now,
                    policy.max_dequeue_count,
                )
            })
            .map(|(key, change)| (key.clone(), change.clone()))
            .collect();
        eligible.sort_by_key(|(_, change)| change.version);
        eligible.truncate(policy.batch_size);

        let expires_at = now + stored_lease_duration(policy.lease_duration);
        let mut rows = Vec::with_capacity(eligible.len());
        for (key, change) in eligible {
            let previous = state.leases.get(&key).map(|lease| self.lease_state(lease));
            let lease = state.leases.entry(key.clone()).or_default();
            lease.expires_at = Some(expires_at);
            lease.dequeue_count += 1;
            let attempt = lease.dequeue_count;

            rows.push(ChangeRow {
                columns: state.rows.get(&key).cloned(),
                key,
                version: change.version,
                operation: change.operation,
                lease: previous,
                attempt,
            });
        }

        Ok(Batch::new(self.watched.table().clone(), rows))
    }

    async fn renew(&self, keys: &[RowKey], lease_duration: Duration) -> Result<u64> {
        let expires_at = Instant::now() + stored_lease_duration(lease_duration);
        let mut state = self.lock();
        if take_failure(&mut state.failures.renewals) {
            bail!("Injected renewal failure");
        }

        let mut renewed = 0;
        for key in keys {
            if let Some(lease) = state.leases.get_mut(key) {
                if lease.expires_at.is_some() {
                    lease.expires_at = Some(expires_at);
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn release(&self, batch: &Batch) -> Result<u64> {
        let mut state = self.lock();
        if take_failure(&mut state.failures.releases) {
            bail!("Injected release failure");
        }

        let mut released = 0;
        for row in batch {
            if let Some(lease) = state.leases.get_mut(&row.key) {
                lease.expires_at = None;
                lease.dequeue_count = 0;
                lease.version_number = Some(
                    lease
                        .version_number
                        .map_or(row.version, |v| v.max(row.version)),
                );
                released += 1;
            }
        }
        Ok(released)
    }

    async fn poisoned_rows(&self, max_dequeue_count: u32) -> Result<Vec<PoisonedRow>> {
        let state = self.lock();
        let mut rows: Vec<PoisonedRow> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.dequeue_count >= max_dequeue_count)
            .map(|(key, lease)| PoisonedRow {
                key: key.clone(),
                dequeue_count: lease.dequeue_count,
                version_number: lease.version_number,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}
