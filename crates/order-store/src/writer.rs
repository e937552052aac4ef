//! Parent-first persistence of order documents.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use order_model::OrderDocument;

use crate::error::PersistenceError;
use crate::store::OrderStore;
use crate::OrderId;

/// How the two inserts of a document are grouped into units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// The order is committed in its own unit of work, then the line items in
    /// a second one. A line item failure leaves the order behind without
    /// items.
    #[default]
    TwoStep,
    /// Both inserts share one unit of work; a line item failure rolls the
    /// order back too.
    Atomic,
}

impl fmt::Display for PersistMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistMode::TwoStep => write!(f, "two-step"),
            PersistMode::Atomic => write!(f, "atomic"),
        }
    }
}

impl FromStr for PersistMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two-step" | "two_step" | "twostep" => Ok(PersistMode::TwoStep),
            "atomic" => Ok(PersistMode::Atomic),
            other => Err(format!("unknown persist mode '{other}'")),
        }
    }
}

/// Outcome of a successful persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedOrder {
    pub order_id: OrderId,
    pub line_items: u64,
}

/// Writes order documents to an [`OrderStore`].
///
/// The order row is always inserted first; its generated key is then
/// assigned to every line item before any line item is written.
#[derive(Clone)]
pub struct OrderWriter<S: OrderStore> {
    store: S,
    mode: PersistMode,
    timeout: Option<Duration>,
}

impl<S: OrderStore> OrderWriter<S> {
    /// Creates a writer using [`PersistMode::TwoStep`] and no timeout.
    pub fn new(store: S) -> Self {
        Self {
            store,
            mode: PersistMode::default(),
            timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bounds the whole persist. `None` waits for the store indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mode(&self) -> PersistMode {
        self.mode
    }

    /// Persists one document, consuming it.
    ///
    /// Units of work opened here are dropped on every path, which rolls back
    /// anything uncommitted and hands the connection back to the store.
    #[tracing::instrument(
        skip(self, doc),
        fields(
            mode = %self.mode,
            customer_id = doc.order.customer_id,
            line_items = doc.line_items.len()
        )
    )]
    pub async fn persist(&self, doc: OrderDocument) -> Result<PersistedOrder, PersistenceError> {
        let start = Instant::now();
        let committed = OnceLock::new();

        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.write(doc, &committed))
                .await
                .unwrap_or_else(|_| {
                    Err(PersistenceError::Timeout {
                        after: limit,
                        orphaned_order: committed.get().copied(),
                    })
                }),
            None => self.write(doc, &committed).await,
        };

        metrics::histogram!("order_store_persist_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(persisted) => {
                metrics::counter!("order_store_orders_inserted_total").increment(1);
                metrics::counter!("order_store_line_items_inserted_total")
                    .increment(persisted.line_items);
                tracing::debug!(order_id = %persisted.order_id, "order persisted");
            }
            Err(e) => {
                metrics::counter!("order_store_persist_failures_total").increment(1);
                tracing::warn!(error = %e, "order persist failed");
            }
        }

        result
    }

    /// `committed` receives the order key once the order row is durable on
    /// its own, so a caller that gives up early can still name the orphan.
    async fn write(
        &self,
        doc: OrderDocument,
        committed: &OnceLock<OrderId>,
    ) -> Result<PersistedOrder, PersistenceError> {
        match self.mode {
            PersistMode::TwoStep => self.write_two_step(doc, committed).await,
            PersistMode::Atomic => self.write_atomic(doc).await,
        }
    }

    async fn write_two_step(
        &self,
        mut doc: OrderDocument,
        committed: &OnceLock<OrderId>,
    ) -> Result<PersistedOrder, PersistenceError> {
        // Step 1: the order, committed on its own so its key is resolvable.
        let mut unit = self
            .store
            .begin()
            .await
            .map_err(PersistenceError::OrderInsert)?;
        let order_id = unit
            .insert_order(&doc.order)
            .await
            .map_err(PersistenceError::OrderInsert)?;
        unit.commit().await.map_err(PersistenceError::OrderInsert)?;
        let _ = committed.set(order_id);

        // Step 2: hand the key to the line items.
        doc.assign_order_id(order_id);

        // Steps 3 and 4: the line items in a second unit of work.
        let orphaned = |source| PersistenceError::LineItemInsert {
            order_id,
            orphaned: true,
            source,
        };
        let mut unit = self.store.begin().await.map_err(orphaned)?;
        let line_items = unit
            .insert_line_items(&doc.line_items)
            .await
            .map_err(orphaned)?;
        unit.commit().await.map_err(orphaned)?;

        Ok(PersistedOrder {
            order_id,
            line_items,
        })
    }

    async fn write_atomic(&self, mut doc: OrderDocument) -> Result<PersistedOrder, PersistenceError> {
        let mut unit = self
            .store
            .begin()
            .await
            .map_err(PersistenceError::OrderInsert)?;
        let order_id = unit
            .insert_order(&doc.order)
            .await
            .map_err(PersistenceError::OrderInsert)?;

        doc.assign_order_id(order_id);

        let rolled_back = |source| PersistenceError::LineItemInsert {
            order_id,
            orphaned: false,
            source,
        };
        let line_items = unit
            .insert_line_items(&doc.line_items)
            .await
            .map_err(rolled_back)?;
        unit.commit().await.map_err(rolled_back)?;

        Ok(PersistedOrder {
            order_id,
            line_items,
        })
    }
}
