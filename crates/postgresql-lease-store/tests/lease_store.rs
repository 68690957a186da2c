//! PostgreSQL lease store integration tests
//!
//! These need a PostgreSQL server. Set `POSTGRESQL_TEST_URL` to use an
//! existing one, otherwise a Docker container is started.
//!
//! Run with: cargo test -p lease-watcher-postgresql -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use lease_watcher::testing::RecordingSink;
use lease_watcher::{
    ChangeOperation, LeasePolicy, LeaseStore, RowKey, TableName, Watcher, WatcherConfig,
    WatcherError,
};
use lease_watcher_postgresql::schema::load_watched_table;
use lease_watcher_postgresql::testing::PostgresContainer;
use lease_watcher_postgresql::{
    disable_change_tracking, enable_change_tracking, new_postgresql_client, new_postgresql_pool,
    PostgresLeaseStore,
};

struct TestDb {
    connection_string: String,
    pool: Pool,
    _container: Option<PostgresContainer>,
}

async fn test_db(name: &str, port: u16) -> Result<TestDb> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (connection_string, container) = match std::env::var("POSTGRESQL_TEST_URL") {
        Ok(url) => (url, None),
        Err(_) => {
            let container = PostgresContainer::new(&format!("lease-watch-test-{name}"), port);
            container.start()?;
            container.wait_until_ready(60).await?;
            (container.connection_string.clone(), Some(container))
        }
    };

    let pool = new_postgresql_pool(&connection_string, 8)?;
    Ok(TestDb {
        connection_string,
        pool,
        _container: container,
    })
}

impl TestDb {
    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {sql}"))
    }

    /// Drop and recreate `table` with `columns`, then enable change tracking.
    async fn tracked_table(&self, table: &str, columns: &str) -> Result<TableName> {
        let name = TableName::parse(table)?;
        let mut client = new_postgresql_client(&self.connection_string).await?;
        disable_change_tracking(&mut client, &name).await?;
        self.execute(&format!(
            "DROP TABLE IF EXISTS {table}_leases; DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({columns});"
        ))
        .await?;
        let watched = load_watched_table(&client, &name).await?;
        enable_change_tracking(&mut client, &watched).await?;
        Ok(name)
    }

    async fn lease_row(&self, lease_table: &str, id: i32) -> Result<(Option<String>, i32, Option<i64>)> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "SELECT lease_expiration_time::text, dequeue_count, version_number FROM {lease_table} WHERE id = $1"
                ),
                &[&id],
            )
            .await?;
        Ok((row.get(0), row.get(1), row.get(2)))
    }
}

fn policy(batch_size: usize) -> LeasePolicy {
    LeasePolicy {
        batch_size,
        lease_duration: Duration::from_secs(30),
        max_dequeue_count: 5,
    }
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_scan_leases_and_release_records_version() -> Result<()> {
    let db = test_db("scan", 15432).await?;
    let table = db
        .tracked_table("lw_products", "id integer PRIMARY KEY, name text")
        .await?;
    db.execute("INSERT INTO lw_products SELECT g, 'product ' || g FROM generate_series(1, 25) g")
        .await?;

    let store = PostgresLeaseStore::open(db.pool.clone(), table).await?;

    let first = store.scan(&policy(10)).await?;
    assert_eq!(first.len(), 10);
    let versions: Vec<i64> = first.iter().map(|r| r.version).collect();
    let mut sorted = versions.clone();
    sorted.sort();
    assert_eq!(versions, sorted);
    let row = &first.rows()[0];
    assert_eq!(row.operation, ChangeOperation::Insert);
    assert_eq!(row.attempt, 1);
    assert!(row.lease.is_none());
    assert_eq!(
        row.columns.as_ref().and_then(|c| c.get("name")).and_then(|v| v.as_str()),
        Some("product 1")
    );

    // Leased rows are not selected again.
    let second = store.scan(&policy(10)).await?;
    let first_keys: HashSet<RowKey> = first.keys().into_iter().collect();
    assert!(second.keys().iter().all(|k| !first_keys.contains(k)));

    assert_eq!(store.release(&first).await?, 10);
    let (expires, dequeue, version) = db.lease_row("lw_products_leases", 1).await?;
    assert_eq!(expires, None);
    assert_eq!(dequeue, 0);
    assert_eq!(version, Some(first.rows()[0].version));

    // Releasing again changes nothing.
    assert_eq!(store.release(&first).await?, 10);
    assert_eq!(
        db.lease_row("lw_products_leases", 1).await?,
        (None, 0, Some(first.rows()[0].version))
    );

    // Delivered versions are not offered again; the remaining five are.
    store.release(&second).await?;
    let third = store.scan(&policy(10)).await?;
    assert_eq!(third.len(), 5);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_change_operations_are_tracked() -> Result<()> {
    let db = test_db("ops", 15433).await?;
    let table = db
        .tracked_table("lw_ops", "id integer PRIMARY KEY, name text")
        .await?;
    db.execute(
        "INSERT INTO lw_ops VALUES (1, 'a'), (2, 'b'), (3, 'c');
         UPDATE lw_ops SET name = 'b2' WHERE id = 2;
         DELETE FROM lw_ops WHERE id = 3;",
    )
    .await?;
    let store = PostgresLeaseStore::open(db.pool.clone(), table).await?;
    let batch = store.scan(&policy(10)).await?;
    store.release(&batch).await?;

    db.execute(
        "UPDATE lw_ops SET name = 'a2' WHERE id = 1;
         UPDATE lw_ops SET id = 10 WHERE id = 2;",
    )
    .await?;
    let batch = store.scan(&policy(10)).await?;
    // A key change records the old key as deleted and the new one as
    // inserted, both at the same version.
    let mut ops: Vec<(String, ChangeOperation, bool)> = batch
        .iter()
        .map(|r| (r.key.values()[0].clone(), r.operation, r.columns.is_some()))
        .collect();
    ops.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        ops,
        vec![
            ("1".to_string(), ChangeOperation::Insert, true),
            ("10".to_string(), ChangeOperation::Insert, true),
            ("2".to_string(), ChangeOperation::Delete, false),
        ]
    );
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_composite_key_round_trips_through_text() -> Result<()> {
    let db = test_db("composite", 15434).await?;
    let table = db
        .tracked_table(
            "lw_order_lines",
            "order_id bigint, line varchar(20), qty integer, PRIMARY KEY (order_id, line)",
        )
        .await?;
    db.execute("INSERT INTO lw_order_lines VALUES (9000000000, 'a', 1), (9000000000, 'b', 2)")
        .await?;

    let store = PostgresLeaseStore::open(db.pool.clone(), table).await?;
    assert_eq!(store.watched_table().primary_key().len(), 2);
    let batch = store.scan(&policy(10)).await?;
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.rows()[0].key, RowKey::new(["9000000000", "a"]));
    assert_eq!(store.renew(&batch.keys(), Duration::from_secs(60)).await?, 2);
    assert_eq!(store.release(&batch).await?, 2);
    assert_eq!(store.renew(&batch.keys(), Duration::from_secs(60)).await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_concurrent_scans_never_share_rows() -> Result<()> {
    let db = test_db("concurrent", 15435).await?;
    let table = db
        .tracked_table("lw_concurrent", "id integer PRIMARY KEY")
        .await?;
    db.execute("INSERT INTO lw_concurrent SELECT g FROM generate_series(1, 15) g")
        .await?;

    let a = PostgresLeaseStore::open(db.pool.clone(), table.clone()).await?;
    let b = PostgresLeaseStore::open(db.pool.clone(), table).await?;
    let policy = policy(10);
    let (first, second) = tokio::join!(a.scan(&policy), b.scan(&policy));
    let (first, second) = (first?, second?);

    let first_keys: HashSet<RowKey> = first.keys().into_iter().collect();
    assert!(second.keys().iter().all(|k| !first_keys.contains(k)));
    assert!(first.len() + second.len() <= 15);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_expired_lease_counts_towards_poisoning() -> Result<()> {
    let db = test_db("poison", 15436).await?;
    let table = db.tracked_table("lw_poison", "id integer PRIMARY KEY").await?;
    db.execute("INSERT INTO lw_poison VALUES (1)").await?;

    let store = PostgresLeaseStore::open(db.pool.clone(), table).await?;
    let short = LeasePolicy {
        batch_size: 10,
        lease_duration: Duration::from_secs(1),
        max_dequeue_count: 2,
    };
    for attempt in 1..=2 {
        let batch = store.scan(&short).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows()[0].attempt, attempt);
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }
    assert!(store.scan(&short).await?.is_empty());

    let poisoned = store.poisoned_rows(2).await?;
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].key, RowKey::new(["1"]));
    assert_eq!(poisoned[0].dequeue_count, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_open_requires_change_tracking() -> Result<()> {
    let db = test_db("untracked", 15437).await?;
    db.execute(
        "DROP TABLE IF EXISTS lw_untracked; CREATE TABLE lw_untracked (id integer PRIMARY KEY);",
    )
    .await?;
    let mut client = new_postgresql_client(&db.connection_string).await?;
    disable_change_tracking(&mut client, &TableName::parse("lw_untracked")?).await?;

    let result = PostgresLeaseStore::open(db.pool.clone(), TableName::parse("lw_untracked")?).await;
    assert!(matches!(result, Err(WatcherError::Startup { .. })));
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_open_rejects_mismatched_lease_table() -> Result<()> {
    let db = test_db("mismatch", 15438).await?;
    let table = db
        .tracked_table("lw_mismatch", "id integer PRIMARY KEY")
        .await?;
    db.execute("CREATE TABLE lw_mismatch_leases (id text PRIMARY KEY, dequeue_count integer)")
        .await?;

    let result = PostgresLeaseStore::open(db.pool.clone(), table).await;
    match result {
        Err(WatcherError::Startup { source, .. }) => {
            assert!(source.to_string().contains("has primary key"));
        }
        other => panic!("expected startup error, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_watcher_delivers_every_row() -> Result<()> {
    let db = test_db("watcher", 15439).await?;
    let table = db
        .tracked_table("lw_watched", "id integer PRIMARY KEY, name text")
        .await?;
    db.execute("INSERT INTO lw_watched SELECT g, 'row ' || g FROM generate_series(1, 12) g")
        .await?;

    let store = Arc::new(PostgresLeaseStore::open(db.pool.clone(), table).await?);
    let sink = Arc::new(RecordingSink::succeeding());
    let mut config = WatcherConfig::new("public.lw_watched");
    config.poll_interval = Duration::from_millis(200);
    config.batch_size = 5;

    let handle = Watcher::start(store, sink.clone(), config).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    db.execute("UPDATE lw_watched SET name = 'changed' WHERE id = 3")
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.stop().await?;

    let delivered = sink.delivered_keys();
    assert_eq!(delivered.len(), 13);
    let unique: HashSet<RowKey> = delivered.into_iter().collect();
    assert_eq!(unique.len(), 12);
    Ok(())
}
