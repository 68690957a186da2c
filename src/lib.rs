//! lease-watch
//!
//! Command-line host for the lease-coordinated change feed watcher. Watches a
//! change-tracked PostgreSQL table and hands each change to a sink at least
//! once, with any number of watcher processes sharing the work.
//!
//! # CLI Usage
//!
//! ```bash
//! # One-off setup: install change tracking on a table
//! lease-watch enable-tracking --connection-string "host=localhost user=postgres" --table public.products
//!
//! # Watch the table, logging each change
//! lease-watch watch --connection-string "host=localhost user=postgres" --table public.products
//!
//! # List rows that exhausted their delivery attempts
//! lease-watch poisoned --connection-string "host=localhost user=postgres" --table public.products
//! ```

pub mod config;
pub mod sink;

pub use config::{ConnectionOpts, TableOpts, WatchOpts};
pub use sink::LoggingSink;
