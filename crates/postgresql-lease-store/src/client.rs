//! PostgreSQL connection utilities
//!
//! Lease stores share one connection pool; every scan, renewal and release
//! checks out its own connection so the coordinator and renewer never wait on
//! each other's transactions.

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::error;

pub const DEFAULT_POOL_SIZE: usize = 4;

/// Create a connection pool. Connections are opened lazily.
pub fn new_postgresql_pool(connection_string: &str, max_size: usize) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = connection_string
        .parse()
        .context("Invalid PostgreSQL connection string")?;

    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    Pool::builder(manager)
        .max_size(max_size.max(1))
        .build()
        .context("Failed to create PostgreSQL connection pool")
}

/// Open a single connection outside the pool, for one-off administrative
/// commands.
pub async fn new_postgresql_client(connection_string: &str) -> Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_connection_string() {
        assert!(new_postgresql_pool("host=localhost port=notaport", 2).is_err());
    }

    #[test]
    fn test_pool_is_created_lazily() {
        let pool = new_postgresql_pool("host=127.0.0.1 port=1 user=postgres", 2).unwrap();
        assert_eq!(pool.status().max_size, 2);
    }
}
