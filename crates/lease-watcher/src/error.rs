//! Errors surfaced to the host of a watcher.
//!
//! Store and sink failures during steady-state operation never reach the host;
//! they are logged and retried on the next tick. Only configuration and startup
//! problems, plus task panics observed on shutdown, are reported here.

use thiserror::Error;

/// Boxed error used to carry the cause of a startup failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum WatcherError {
    /// Invalid or missing configuration value
    #[error("Invalid watcher configuration: {0}")]
    Config(String),

    /// The watched table could not be prepared for watching
    #[error("Failed to start watcher for table '{table}': {source}")]
    Startup {
        table: String,
        #[source]
        source: BoxError,
    },

    /// A background task panicked or was aborted
    #[error("Watcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WatcherError {
    pub fn config(message: impl Into<String>) -> Self {
        WatcherError::Config(message.into())
    }

    pub fn startup(table: impl std::fmt::Display, source: impl Into<BoxError>) -> Self {
        WatcherError::Startup {
            table: table.to_string(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_keeps_context_chain() {
        let cause = anyhow::anyhow!("no primary key").context("discovering primary key");
        let err = WatcherError::startup("public.products", cause);
        let message = err.to_string();
        assert!(message.contains("public.products"));
        assert!(message.contains("discovering primary key"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_message() {
        let err = WatcherError::config("batch_size must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid watcher configuration: batch_size must be at least 1"
        );
    }
}
