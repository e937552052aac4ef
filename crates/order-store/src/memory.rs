use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use order_model::{Order, OrderLineItem};

use crate::store::{OrderStore, UnitOfWork, parent_id_of};
use crate::{OrderId, Result, StoreError};

#[derive(Debug, Default)]
struct InMemoryState {
    orders: BTreeMap<OrderId, Order>,
    line_items: Vec<OrderLineItem>,
    next_id: i64,
    open_units: usize,
    units_opened: usize,
    fail_on_begin: bool,
    fail_on_order_insert: bool,
    fail_on_line_item_insert: bool,
    insert_delay: Option<Duration>,
}

/// In-memory order store for testing.
///
/// Mirrors the Postgres schema closely enough to exercise the writer: keys
/// come from a sequence that is never rolled back, line items must point at
/// an existing order, and the quantity/price checks match the table
/// constraints. Failures can be injected per step.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `begin` fail.
    pub fn set_fail_on_begin(&self, fail: bool) {
        self.lock().fail_on_begin = fail;
    }

    /// Makes every order insert fail.
    pub fn set_fail_on_order_insert(&self, fail: bool) {
        self.lock().fail_on_order_insert = fail;
    }

    /// Makes every line item insert fail.
    pub fn set_fail_on_line_item_insert(&self, fail: bool) {
        self.lock().fail_on_line_item_insert = fail;
    }

    /// Delays every insert, simulating a slow round trip.
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        self.lock().insert_delay = delay;
    }

    /// Units of work currently open.
    pub fn open_units(&self) -> usize {
        self.lock().open_units
    }

    /// Units of work opened since creation.
    pub fn units_opened(&self) -> usize {
        self.lock().units_opened
    }

    /// All committed orders, ordered by key.
    pub fn orders(&self) -> Vec<Order> {
        self.lock().orders.values().cloned().collect()
    }

    /// All committed line items, in commit order.
    pub fn line_items(&self) -> Vec<OrderLineItem> {
        self.lock().line_items.clone()
    }

    fn insert_delay(&self) -> Option<Duration> {
        self.lock().insert_delay
    }
}

struct InMemoryUnitOfWork {
    store: InMemoryOrderStore,
    pending_orders: Vec<Order>,
    pending_items: Vec<OrderLineItem>,
}

impl InMemoryUnitOfWork {
    async fn simulate_latency(&self) {
        if let Some(delay) = self.store.insert_delay() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn check_line_item(item: &OrderLineItem) -> Result<()> {
    if item.quantity <= 0 {
        return Err(StoreError::Constraint(
            "order_line_items_quantity_check".to_string(),
        ));
    }
    if item.unit_price_cents < 0 {
        return Err(StoreError::Constraint(
            "order_line_items_unit_price_cents_check".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_order(&mut self, order: &Order) -> Result<OrderId> {
        self.simulate_latency().await;

        let mut state = self.store.lock();
        if state.fail_on_order_insert {
            return Err(StoreError::Unavailable(
                "order insert rejected".to_string(),
            ));
        }

        state.next_id += 1;
        let id = OrderId::new(state.next_id);
        drop(state);

        let mut stored = order.clone();
        stored.id = Some(id);
        self.pending_orders.push(stored);
        Ok(id)
    }

    async fn insert_line_items(&mut self, items: &[OrderLineItem]) -> Result<u64> {
        self.simulate_latency().await;

        let state = self.store.lock();
        if state.fail_on_line_item_insert {
            return Err(StoreError::Unavailable(
                "line item insert rejected".to_string(),
            ));
        }

        // Validate the whole batch first so a failure leaves nothing pending,
        // matching a statement-level rollback in Postgres.
        for item in items {
            let parent = parent_id_of(item)?;
            let known = state.orders.contains_key(&parent)
                || self.pending_orders.iter().any(|o| o.id == Some(parent));
            if !known {
                return Err(StoreError::UnknownParent(parent));
            }
            check_line_item(item)?;
        }
        drop(state);

        self.pending_items.extend_from_slice(items);
        Ok(items.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut unit = self;
        let orders = std::mem::take(&mut unit.pending_orders);
        let mut items = std::mem::take(&mut unit.pending_items);

        let mut state = unit.store.lock();
        for order in orders {
            if let Some(id) = order.id {
                state.orders.insert(id, order);
            }
        }
        state.line_items.append(&mut items);
        Ok(())
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        self.store.lock().open_units -= 1;
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let mut state = self.lock();
        if state.fail_on_begin {
            return Err(StoreError::Unavailable("no connection available".to_string()));
        }
        state.open_units += 1;
        state.units_opened += 1;
        drop(state);

        Ok(Box::new(InMemoryUnitOfWork {
            store: self.clone(),
            pending_orders: Vec::new(),
            pending_items: Vec::new(),
        }))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.lock().orders.get(&id).cloned())
    }

    async fn line_items_for(&self, id: OrderId) -> Result<Vec<OrderLineItem>> {
        Ok(self
            .lock()
            .line_items
            .iter()
            .filter(|item| item.order_id == Some(id))
            .cloned()
            .collect())
    }

    async fn order_count(&self) -> Result<u64> {
        Ok(self.lock().orders.len() as u64)
    }

    async fn line_item_count(&self) -> Result<u64> {
        Ok(self.lock().line_items.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn order() -> Order {
        Order::new(
            DateTime::parse_from_rfc3339("2023-05-01T10:00:00+02:00").unwrap(),
            42,
            7,
        )
    }

    fn item_for(id: OrderId, quantity: i32) -> OrderLineItem {
        let mut item = OrderLineItem::new("SKU-1", quantity, 100);
        item.order_id = Some(id);
        item
    }

    #[tokio::test]
    async fn committed_unit_is_visible() {
        let store = InMemoryOrderStore::new();

        let mut unit = store.begin().await.unwrap();
        let id = unit.insert_order(&order()).await.unwrap();
        unit.insert_line_items(&[item_for(id, 1), item_for(id, 2)])
            .await
            .unwrap();
        unit.commit().await.unwrap();

        let stored = store.get_order(id).await.unwrap().unwrap();
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.created_at, order().created_at);
        assert_eq!(store.line_items_for(id).await.unwrap().len(), 2);
        assert_eq!(store.open_units(), 0);
    }

    #[tokio::test]
    async fn dropped_unit_is_rolled_back_and_released() {
        let store = InMemoryOrderStore::new();

        {
            let mut unit = store.begin().await.unwrap();
            unit.insert_order(&order()).await.unwrap();
            assert_eq!(store.open_units(), 1);
        }

        assert_eq!(store.order_count().await.unwrap(), 0);
        assert_eq!(store.open_units(), 0);
    }

    #[tokio::test]
    async fn keys_are_not_reused_after_rollback() {
        let store = InMemoryOrderStore::new();

        let mut unit = store.begin().await.unwrap();
        let first = unit.insert_order(&order()).await.unwrap();
        drop(unit);

        let mut unit = store.begin().await.unwrap();
        let second = unit.insert_order(&order()).await.unwrap();
        unit.commit().await.unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn line_item_without_parent_id_is_rejected() {
        let store = InMemoryOrderStore::new();
        let mut unit = store.begin().await.unwrap();

        let err = unit
            .insert_line_items(&[OrderLineItem::new("SKU-1", 1, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParentId { .. }));
    }

    #[tokio::test]
    async fn line_item_with_unknown_parent_is_rejected() {
        let store = InMemoryOrderStore::new();
        let mut unit = store.begin().await.unwrap();

        let err = unit
            .insert_line_items(&[item_for(OrderId::new(404), 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownParent(id) if id == OrderId::new(404)));
    }

    #[tokio::test]
    async fn quantity_check_rejects_whole_batch() {
        let store = InMemoryOrderStore::new();
        let mut unit = store.begin().await.unwrap();
        let id = unit.insert_order(&order()).await.unwrap();

        let err = unit
            .insert_line_items(&[item_for(id, 1), item_for(id, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        unit.commit().await.unwrap();
        assert_eq!(store.order_count().await.unwrap(), 1);
        assert_eq!(store.line_item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = InMemoryOrderStore::new();

        store.set_fail_on_begin(true);
        assert!(store.begin().await.is_err());
        store.set_fail_on_begin(false);

        store.set_fail_on_order_insert(true);
        let mut unit = store.begin().await.unwrap();
        assert!(matches!(
            unit.insert_order(&order()).await,
            Err(StoreError::Unavailable(_))
        ));
        drop(unit);
        assert_eq!(store.open_units(), 0);
        assert_eq!(store.units_opened(), 1);
    }
}
