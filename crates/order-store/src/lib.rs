//! Relational persistence for order documents.
//!
//! - [`OrderStore`] / [`UnitOfWork`]: the store collaborator (open a scoped
//!   unit of work, insert an order and get its key, insert line items)
//! - [`PostgresOrderStore`] and [`InMemoryOrderStore`] implementations
//! - [`OrderWriter`]: writes a document parent-first and assigns the
//!   generated key to every line item

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod writer;

pub use common::OrderId;
pub use error::{PersistenceError, Result, StoreError};
pub use memory::InMemoryOrderStore;
pub use postgres::{MIGRATOR, PostgresOrderStore};
pub use store::{OrderStore, UnitOfWork};
pub use writer::{OrderWriter, PersistMode, PersistedOrder};
