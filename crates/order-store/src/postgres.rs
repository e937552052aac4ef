use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use order_model::{Order, OrderLineItem};
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::store::{OrderStore, UnitOfWork, parent_id_of};
use crate::{OrderId, Result, StoreError};

/// Embedded migrations for the order tables and the queue table.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let instant: DateTime<Utc> = row.try_get("created_at")?;
        let offset_seconds: i32 = row.try_get("created_at_offset_seconds")?;
        let offset =
            FixedOffset::east_opt(offset_seconds).ok_or(StoreError::InvalidOffset(offset_seconds))?;

        Ok(Order {
            id: Some(OrderId::new(row.try_get("id")?)),
            created_at: instant.with_timezone(&offset),
            customer_id: row.try_get("customer_id")?,
            seller_id: row.try_get("seller_id")?,
        })
    }

    fn row_to_line_item(row: PgRow) -> Result<OrderLineItem> {
        Ok(OrderLineItem {
            order_id: Some(OrderId::new(row.try_get("order_id")?)),
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            unit_price_cents: row.try_get("unit_price_cents")?,
        })
    }
}

/// A Postgres transaction. Rolled back by sqlx when dropped uncommitted.
struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    next_position: i32,
}

fn map_constraint(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && let Some(constraint) = db_err.constraint()
    {
        return StoreError::Constraint(constraint.to_string());
    }
    StoreError::Database(e)
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_order(&mut self, order: &Order) -> Result<OrderId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (created_at, created_at_offset_seconds, customer_id, seller_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(order.created_at.with_timezone(&Utc))
        .bind(order.created_at.offset().fix().local_minus_utc())
        .bind(order.customer_id)
        .bind(order.seller_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_constraint)?;

        Ok(OrderId::new(id))
    }

    async fn insert_line_items(&mut self, items: &[OrderLineItem]) -> Result<u64> {
        let mut written = 0;
        for item in items {
            let order_id = parent_id_of(item)?;

            let result = sqlx::query(
                r#"
                INSERT INTO order_line_items (order_id, position, product_id, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order_id.as_i64())
            .bind(self.next_position)
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .execute(&mut *self.tx)
            .await
            .map_err(map_constraint)?;

            self.next_position += 1;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork {
            tx,
            next_position: 0,
        }))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, created_at, created_at_offset_seconds, customer_id, seller_id
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn line_items_for(&self, id: OrderId) -> Result<Vec<OrderLineItem>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, quantity, unit_price_cents
            FROM order_line_items
            WHERE order_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_line_item).collect()
    }

    async fn order_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn line_item_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_line_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
