use std::time::Duration;

use thiserror::Error;

use crate::OrderId;

/// Errors raised by an order store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A line item was handed to the store before its parent key was assigned.
    #[error("Line item for product '{product_id}' has no parent order id")]
    MissingParentId { product_id: String },

    /// A line item references an order the store does not know.
    #[error("Parent order {0} does not exist")]
    UnknownParent(OrderId),

    /// A row violated a table constraint.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A stored offset is outside the range chrono accepts.
    #[error("Stored UTC offset {0}s is out of range")]
    InvalidOffset(i32),

    /// The store could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`crate::OrderWriter::persist`].
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The parent order could not be written. No line items were written.
    #[error("Order insert failed: {0}")]
    OrderInsert(#[source] StoreError),

    /// The parent order was written but its line items were not.
    ///
    /// `orphaned` is true when the order row stays behind without items.
    #[error("Line item insert for order {order_id} failed (orphaned order: {orphaned}): {source}")]
    LineItemInsert {
        order_id: OrderId,
        orphaned: bool,
        #[source]
        source: StoreError,
    },

    /// The write did not finish within the configured limit.
    ///
    /// `orphaned_order` is set when the order row was already committed.
    #[error("Persist timed out after {after:?} (orphaned order: {})", describe_orphan(.orphaned_order))]
    Timeout {
        after: Duration,
        orphaned_order: Option<OrderId>,
    },
}

impl PersistenceError {
    /// The order row this failure left committed without its line items.
    pub fn orphaned_order(&self) -> Option<OrderId> {
        match self {
            PersistenceError::LineItemInsert {
                order_id,
                orphaned: true,
                ..
            } => Some(*order_id),
            PersistenceError::Timeout { orphaned_order, .. } => *orphaned_order,
            _ => None,
        }
    }
}

fn describe_orphan(order: &Option<OrderId>) -> String {
    match order {
        Some(id) => format!("true, order {id}"),
        None => "false".to_string(),
    }
}
