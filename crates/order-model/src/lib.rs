//! Order document model and the decoder for queue payloads.
//!
//! An [`OrderDocument`] is the unit the ingest pipeline moves around: one
//! [`Order`] plus its ordered [`OrderLineItem`]s. Documents are built from a
//! queue message with [`decode`] and consumed once by the persistence writer.

pub mod decode;
pub mod document;
pub mod error;

pub use common::OrderId;
pub use decode::{decode, decode_bytes, encode};
pub use document::{Order, OrderDocument, OrderLineItem};
pub use error::{DecodeError, Result};
