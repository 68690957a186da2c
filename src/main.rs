//! Command-line interface for lease-watch
//!
//! # Usage Examples
//!
//! ## Change tracking setup
//! ```bash
//! lease-watch enable-tracking \
//!   --connection-string "host=localhost user=postgres dbname=shop" \
//!   --table public.products
//!
//! lease-watch disable-tracking \
//!   --connection-string "host=localhost user=postgres dbname=shop" \
//!   --table public.products
//! ```
//!
//! ## Watching
//! ```bash
//! # Any number of these can run against the same table
//! LEASE_WATCH_CONNECTION_STRING="host=localhost user=postgres dbname=shop" \
//! lease-watch watch --table public.products \
//!   --batch-size 50 --lease-duration 1m --poll-interval 2s
//! ```
//!
//! ## Inspecting poisoned rows
//! ```bash
//! lease-watch poisoned --table public.products --max-dequeue-count 5
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lease_watch::{ConnectionOpts, LoggingSink, TableOpts, WatchOpts};
use lease_watcher::config::DEFAULT_MAX_DEQUEUE_COUNT;
use lease_watcher::{LeaseStore, TableName, Watcher};
use lease_watcher_postgresql::schema::load_watched_table;
use lease_watcher_postgresql::{
    disable_change_tracking, enable_change_tracking, new_postgresql_client, new_postgresql_pool,
    PostgresLeaseStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "lease-watch")]
#[command(about = "Deliver every change to a PostgreSQL table at least once, across many watchers")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a table and log each change until interrupted
    Watch {
        #[command(flatten)]
        connection: ConnectionOpts,

        #[command(flatten)]
        watch: WatchOpts,

        /// Include the row's current column values in the log
        #[arg(long)]
        log_columns: bool,
    },

    /// Install change tracking on a table
    EnableTracking {
        #[command(flatten)]
        connection: ConnectionOpts,

        #[command(flatten)]
        table: TableOpts,
    },

    /// Remove change tracking from a table, discarding tracked changes
    DisableTracking {
        #[command(flatten)]
        connection: ConnectionOpts,

        #[command(flatten)]
        table: TableOpts,
    },

    /// List rows that reached the dequeue limit
    Poisoned {
        #[command(flatten)]
        connection: ConnectionOpts,

        #[command(flatten)]
        table: TableOpts,

        /// Dequeue count at which a row counts as poisoned
        #[arg(long, default_value_t = DEFAULT_MAX_DEQUEUE_COUNT)]
        max_dequeue_count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            connection,
            watch,
            log_columns,
        } => run_watch(connection, watch, log_columns).await,
        Commands::EnableTracking { connection, table } => {
            let table = TableName::parse(&table.table)?;
            let mut client = new_postgresql_client(connection.connection_string()?).await?;
            let watched = load_watched_table(&client, &table).await?;
            enable_change_tracking(&mut client, &watched).await
        }
        Commands::DisableTracking { connection, table } => {
            let table = TableName::parse(&table.table)?;
            let mut client = new_postgresql_client(connection.connection_string()?).await?;
            disable_change_tracking(&mut client, &table).await
        }
        Commands::Poisoned {
            connection,
            table,
            max_dequeue_count,
        } => {
            let table = TableName::parse(&table.table)?;
            let pool = new_postgresql_pool(connection.connection_string()?, 1)?;
            let store = PostgresLeaseStore::open(pool, table.clone()).await?;
            let rows = store.poisoned_rows(max_dequeue_count).await?;
            for row in &rows {
                let version = row
                    .version_number
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "never delivered".to_string());
                println!(
                    "{} dequeue_count={} last_delivered_version={version}",
                    row.key, row.dequeue_count
                );
            }
            info!(table = %table, count = rows.len(), "Listed poisoned rows");
            Ok(())
        }
    }
}

async fn run_watch(
    connection: ConnectionOpts,
    watch: WatchOpts,
    log_columns: bool,
) -> anyhow::Result<()> {
    let config = watch.to_config()?;
    let table = config.table_name()?;
    let pool = new_postgresql_pool(connection.connection_string()?, connection.pool_size)?;
    let store = Arc::new(PostgresLeaseStore::open(pool, table).await?);
    let sink = Arc::new(LoggingSink::new(log_columns));

    let handle = Watcher::start(store, sink, config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping watcher");

    let stats = handle.stop().await?;
    info!(
        scans = stats.scans,
        rows_leased = stats.rows_leased,
        batches_delivered = stats.batches_delivered,
        batches_abandoned = stats.batches_abandoned,
        "Watcher finished"
    );
    Ok(())
}
