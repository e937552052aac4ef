//! Ingest error types.

use common::{MessageId, OrderId};
use order_model::DecodeError;
use order_store::PersistenceError;
use thiserror::Error;

use crate::notify::FailureStage;

/// Errors talking to the broker. These are logged, never notified.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A database error occurred in a Postgres-backed queue.
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The client has been closed and accepts no more calls.
    #[error("Queue client is closed")]
    Closed,

    /// The lease on a message expired before it was settled.
    #[error("Lock on message {0} was lost")]
    LockLost(MessageId),

    /// Any other broker-side failure.
    #[error("Broker error: {0}")]
    Broker(String),
}

/// Errors processing one message after it was received.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ProcessingError {
    /// The pipeline stage that failed.
    pub fn stage(&self) -> FailureStage {
        match self {
            ProcessingError::Decode(_) => FailureStage::Decode,
            ProcessingError::Persistence(_) => FailureStage::Persist,
        }
    }

    /// The order row the failure left committed without its line items.
    pub fn orphaned_order(&self) -> Option<OrderId> {
        match self {
            ProcessingError::Decode(_) => None,
            ProcessingError::Persistence(e) => e.orphaned_order(),
        }
    }
}

/// Errors delivering a failure report. Swallowed by every notifier.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification endpoint answered with status {status}")]
    Rejected { status: u16 },
}

/// Errors from the consumer lifecycle.
#[derive(Debug, Error)]
pub enum IngestError {
    /// `run` was called while the consumer was not stopped.
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// `run` was called after a previous run closed the queue client.
    #[error("Consumer has stopped and its queue client is closed")]
    ClientClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The consumer task panicked or was cancelled.
    #[error("Consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
