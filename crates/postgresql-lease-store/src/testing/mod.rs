//! Testing utilities for the PostgreSQL lease store
//!
//! This module provides Docker container management for PostgreSQL testing.

pub mod container;

pub use container::PostgresContainer;
