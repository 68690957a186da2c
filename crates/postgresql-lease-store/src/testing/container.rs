//! Docker container management for PostgreSQL testing

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::client::new_postgresql_client;

/// A throwaway PostgreSQL server in Docker
pub struct PostgresContainer {
    pub container_name: String,
    pub host_port: u16,
    pub image_name: String,
    pub connection_string: String,
}

impl PostgresContainer {
    pub fn new(container_name: &str, host_port: u16) -> Self {
        Self {
            container_name: container_name.to_string(),
            host_port,
            image_name: "postgres:16".to_string(),
            connection_string: format!(
                "host=127.0.0.1 port={host_port} user=postgres password=postgres dbname=testdb"
            ),
        }
    }

    fn docker(args: &[&str]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .with_context(|| format!("Failed to run docker {}", args.join(" ")))
    }

    /// Replaces any container with the same name and starts a fresh one
    pub fn start(&self) -> Result<()> {
        info!("Starting PostgreSQL container: {}", self.container_name);

        for action in ["stop", "rm"] {
            let _ = Command::new("docker")
                .args([action, &self.container_name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }

        let port_mapping = format!("{}:5432", self.host_port);
        let output = Self::docker(&[
            "run",
            "--name",
            &self.container_name,
            "-e",
            "POSTGRES_PASSWORD=postgres",
            "-e",
            "POSTGRES_DB=testdb",
            "-p",
            &port_mapping,
            "-d",
            &self.image_name,
        ])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start container: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Started container: {}", container_id);
        Ok(())
    }

    pub async fn wait_until_ready(&self, timeout_secs: u64) -> Result<()> {
        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        while start.elapsed() < timeout {
            match self.test_connection().await {
                Ok(()) => {
                    info!("PostgreSQL is ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connection attempt failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        anyhow::bail!("PostgreSQL did not become ready within {timeout_secs} seconds")
    }

    async fn test_connection(&self) -> Result<()> {
        let client = new_postgresql_client(&self.connection_string).await?;
        client
            .simple_query("SELECT 1")
            .await
            .context("Failed to execute test query")?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        info!("Stopping container: {}", self.container_name);

        for action in ["stop", "rm"] {
            let output = Self::docker(&[action, &self.container_name])?;
            if !output.status.success() {
                debug!(
                    "docker {action} failed (container may not exist): {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }
        Ok(())
    }
}

impl Drop for PostgresContainer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
