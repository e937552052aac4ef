//! Worker error types.

use std::time::Duration;

use ingest::IngestError;
use order_store::StoreError;
use thiserror::Error;

/// Errors that stop the worker from starting or shutting down cleanly.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// An environment variable was set to something unusable.
    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    /// A database could not be reached.
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A database did not answer within the connect timeout.
    #[error("Timed out connecting to {target} after {timeout:?}")]
    ConnectTimeout {
        target: &'static str,
        timeout: Duration,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Consumer error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// The health/metrics listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
