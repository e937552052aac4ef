//! Failure reporting to an out-of-band channel.
//!
//! A [`Notifier`] never hands an error back to its caller: delivery problems
//! are logged inside the implementation so the consumer loop keeps going.

pub mod log;
pub mod recording;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use serde::Serialize;

use crate::broker::Delivery;
use crate::error::ProcessingError;

pub use log::LogNotifier;
pub use recording::RecordingNotifier;
pub use webhook::WebhookNotifier;

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Decode,
    Persist,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStage::Decode => write!(f, "decode"),
            FailureStage::Persist => write!(f, "persist"),
        }
    }
}

/// A human-readable account of one failed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub queue: String,
    pub message_id: MessageId,
    pub delivery_count: u32,
    pub stage: FailureStage,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(queue: &str, delivery: &Delivery, error: &ProcessingError) -> Self {
        Self {
            queue: queue.to_string(),
            message_id: delivery.message_id,
            delivery_count: delivery.delivery_count,
            stage: error.stage(),
            error: error.to_string(),
            occurred_at: Utc::now(),
        }
    }

    /// One-line summary suitable for a subject line.
    pub fn summary(&self) -> String {
        format!(
            "Order ingest {} failure on queue '{}' (message {})",
            self.stage, self.queue, self.message_id
        )
    }
}

/// Reports pipeline failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers the report on a best-effort basis.
    async fn notify(&self, report: &FailureReport);
}
