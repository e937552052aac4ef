//! Order document types.

use chrono::{DateTime, FixedOffset};
use common::OrderId;

/// A customer order as received from the upstream producer.
///
/// `created_at` keeps the offset the producer wrote it with; it is never
/// normalized to UTC or to the local zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Store-generated key. `None` until the order has been inserted.
    pub id: Option<OrderId>,
    pub created_at: DateTime<FixedOffset>,
    pub customer_id: i64,
    pub seller_id: i64,
}

impl Order {
    /// Creates an order that has not been persisted yet.
    pub fn new(created_at: DateTime<FixedOffset>, customer_id: i64, seller_id: i64) -> Self {
        Self {
            id: None,
            created_at,
            customer_id,
            seller_id,
        }
    }

    /// Returns true once the store has assigned an identifier.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// One line of an order.
///
/// Product, quantity and price are carried through to the store untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineItem {
    /// Parent order key. Assigned by the writer after the parent insert.
    pub order_id: Option<OrderId>,
    pub product_id: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

impl OrderLineItem {
    pub fn new(product_id: impl Into<String>, quantity: i32, unit_price_cents: i64) -> Self {
        Self {
            order_id: None,
            product_id: product_id.into(),
            quantity,
            unit_price_cents,
        }
    }
}

/// An order together with its line items, decoded from one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDocument {
    pub order: Order,
    pub line_items: Vec<OrderLineItem>,
}

impl OrderDocument {
    pub fn new(order: Order, line_items: Vec<OrderLineItem>) -> Self {
        Self { order, line_items }
    }

    /// Records the store-generated key on the order and on every line item.
    pub fn assign_order_id(&mut self, id: OrderId) {
        self.order.id = Some(id);
        for item in &mut self.line_items {
            item.order_id = Some(id);
        }
    }

    pub fn line_item_count(&self) -> usize {
        self.line_items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> OrderDocument {
        let created_at = DateTime::parse_from_rfc3339("2023-05-01T10:00:00+02:00").unwrap();
        OrderDocument::new(
            Order::new(created_at, 42, 7),
            vec![
                OrderLineItem::new("SKU-1", 1, 500),
                OrderLineItem::new("SKU-2", 3, 120),
            ],
        )
    }

    #[test]
    fn new_order_is_not_persisted() {
        let doc = sample_document();
        assert!(!doc.order.is_persisted());
        assert!(doc.line_items.iter().all(|item| item.order_id.is_none()));
    }

    #[test]
    fn assign_order_id_reaches_every_line_item() {
        let mut doc = sample_document();
        doc.assign_order_id(OrderId::new(11));

        assert_eq!(doc.order.id, Some(OrderId::new(11)));
        assert!(doc.order.is_persisted());
        assert!(
            doc.line_items
                .iter()
                .all(|item| item.order_id == Some(OrderId::new(11)))
        );
    }

    #[test]
    fn assign_order_id_without_line_items() {
        let mut doc = sample_document();
        doc.line_items.clear();
        doc.assign_order_id(OrderId::new(3));
        assert_eq!(doc.order.id, Some(OrderId::new(3)));
        assert_eq!(doc.line_item_count(), 0);
    }
}
