//! Shared identifier types for the order ingest pipeline.

pub mod types;

pub use types::{MessageId, OrderId};
