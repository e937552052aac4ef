//! Message-driven ingestion of order documents.
//!
//! The [`QueueConsumer`] pulls deliveries from a [`QueueClient`] and hands
//! each one to the [`MessageHandler`], which decodes the payload, persists it
//! through an [`order_store::OrderWriter`], and reports failures to a
//! [`Notifier`]. A failing message never stops the consumer loop.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod notify;

pub use broker::{Delivery, InMemoryQueue, PostgresQueue, QueueClient};
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerState, QueueConsumer};
pub use error::{IngestError, NotificationError, ProcessingError, TransportError};
pub use handler::{AckMode, Disposition, HandlerConfig, MessageHandler, Outcome};
pub use notify::{
    FailureReport, FailureStage, LogNotifier, Notifier, RecordingNotifier, WebhookNotifier,
};
