//! Broker client trait and implementations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use common::MessageId;
use uuid::Uuid;

use crate::error::TransportError;

pub use memory::InMemoryQueue;
pub use postgres::PostgresQueue;

/// One leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub body: String,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,
    /// Identifies this lease; settling with a stale token fails.
    pub lock_token: Uuid,
}

/// A connected client for one queue.
///
/// One instance is shared by the receive loop and every in-flight handler,
/// so implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Name of the queue this client reads from.
    fn queue_name(&self) -> &str;

    /// Leases the next available message, or returns `None` when the queue
    /// is empty.
    async fn receive(&self) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledges a message so it is never redelivered.
    async fn complete(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Releases a message for immediate redelivery.
    async fn abandon(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Moves a message aside so it is never redelivered, keeping the reason.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Stops delivery. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
