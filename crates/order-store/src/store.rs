use async_trait::async_trait;
use order_model::{Order, OrderLineItem};

use crate::{OrderId, Result};

/// A scoped transaction against the order store.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls back
/// everything written through it and releases the underlying connection, so
/// every exit path of a caller gives the resource back.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Inserts an order and returns the key the store generated for it.
    ///
    /// The `id` already present on `order` is ignored.
    async fn insert_order(&mut self, order: &Order) -> Result<OrderId>;

    /// Inserts line items in the given order.
    ///
    /// Every item must carry its parent key. Returns the number of rows written.
    async fn insert_line_items(&mut self, items: &[OrderLineItem]) -> Result<u64>;

    /// Makes everything written through this unit durable.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// The relational store that orders and line items are written to.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Opens a fresh unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Loads a committed order by key.
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Loads the committed line items of an order, in insertion order.
    async fn line_items_for(&self, id: OrderId) -> Result<Vec<OrderLineItem>>;

    /// Counts committed orders.
    async fn order_count(&self) -> Result<u64>;

    /// Counts committed line items across all orders.
    async fn line_item_count(&self) -> Result<u64>;
}

/// Checks that every line item already carries its parent key.
pub(crate) fn parent_id_of(item: &OrderLineItem) -> Result<OrderId> {
    item.order_id
        .ok_or_else(|| crate::StoreError::MissingParentId {
            product_id: item.product_id.clone(),
        })
}
