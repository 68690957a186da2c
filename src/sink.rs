//! Sink that logs every change it receives.

use anyhow::Result;
use async_trait::async_trait;
use lease_watcher::{Batch, DeliveryOutcome, ExecutionSink};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct LoggingSink {
    /// Also log the row's current column values
    pub include_columns: bool,
}

impl LoggingSink {
    pub fn new(include_columns: bool) -> Self {
        Self { include_columns }
    }

    pub fn describe(batch: &Batch) -> Vec<String> {
        batch
            .iter()
            .map(|row| format!("Change occurred to {} row: {}", batch.table(), row.operation))
            .collect()
    }
}

#[async_trait]
impl ExecutionSink for LoggingSink {
    async fn deliver(&self, batch: &Batch) -> Result<DeliveryOutcome> {
        for (row, message) in batch.iter().zip(Self::describe(batch)) {
            if self.include_columns {
                let columns = row
                    .columns
                    .as_ref()
                    .map(|c| serde_json::Value::Object(c.clone()).to_string())
                    .unwrap_or_else(|| "null".to_string());
                info!(key = %row.key, version = row.version, attempt = row.attempt, %columns, "{message}");
            } else {
                info!(key = %row.key, version = row.version, attempt = row.attempt, "{message}");
            }
        }
        Ok(DeliveryOutcome::Succeeded)
    }
}
