//! JSON wire format for order documents.
//!
//! Timestamps travel as RFC 3339 strings and must carry an explicit offset.
//! The parsed value keeps that offset so `+02:00` in means `+02:00` out.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::document::{Order, OrderDocument, OrderLineItem};
use crate::error::{DecodeError, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrder {
    created_at: String,
    customer_id: i64,
    seller_id: i64,
    #[serde(default)]
    line_items: Vec<WireLineItem>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLineItem {
    product_id: String,
    quantity: i32,
    unit_price_cents: i64,
}

fn parse_timestamp(value: String) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(&value)
        .map_err(|source| DecodeError::InvalidTimestamp { value, source })
}

impl TryFrom<WireOrder> for OrderDocument {
    type Error = DecodeError;

    fn try_from(wire: WireOrder) -> Result<Self> {
        let created_at = parse_timestamp(wire.created_at)?;
        let line_items = wire
            .line_items
            .into_iter()
            .map(|item| OrderLineItem::new(item.product_id, item.quantity, item.unit_price_cents))
            .collect();

        Ok(OrderDocument::new(
            Order::new(created_at, wire.customer_id, wire.seller_id),
            line_items,
        ))
    }
}

impl From<&OrderDocument> for WireOrder {
    fn from(doc: &OrderDocument) -> Self {
        Self {
            created_at: doc.order.created_at.to_rfc3339(),
            customer_id: doc.order.customer_id,
            seller_id: doc.order.seller_id,
            line_items: doc
                .line_items
                .iter()
                .map(|item| WireLineItem {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                })
                .collect(),
        }
    }
}

/// Decodes a text payload into an order document.
///
/// Identifiers sent by the producer are ignored; the returned document is
/// always unpersisted.
pub fn decode(payload: &str) -> Result<OrderDocument> {
    let wire: WireOrder = serde_json::from_str(payload)?;
    OrderDocument::try_from(wire)
}

/// Decodes a raw byte payload into an order document.
pub fn decode_bytes(payload: &[u8]) -> Result<OrderDocument> {
    let wire: WireOrder = serde_json::from_slice(payload)?;
    OrderDocument::try_from(wire)
}

/// Encodes an order document into the wire format accepted by [`decode`].
pub fn encode(doc: &OrderDocument) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string(&WireOrder::from(doc))
}
