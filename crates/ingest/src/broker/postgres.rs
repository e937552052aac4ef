use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::MessageId;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Delivery, QueueClient};
use crate::error::TransportError;

/// Queue backed by the `queue_messages` table.
///
/// Receiving leases the oldest visible row with `FOR UPDATE SKIP LOCKED`, so
/// any number of consumers can share a queue. A lease that is never settled
/// becomes visible again once `lock_duration` has passed.
pub struct PostgresQueue {
    pool: PgPool,
    queue: String,
    lock_duration: Duration,
    closed: AtomicBool,
}

impl PostgresQueue {
    /// Creates a client for `queue` on an existing pool.
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
            lock_duration: Duration::from_secs(60),
            closed: AtomicBool::new(false),
        }
    }

    /// Connects to the broker database and returns a client for `queue`.
    ///
    /// `max_connections` caps the outbound connections this client opens.
    pub async fn connect(
        url: &str,
        queue: impl Into<String>,
        max_connections: u32,
    ) -> Result<Self, TransportError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, queue))
    }

    /// How long a received message stays invisible to other receivers.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publishes a message body onto the queue.
    pub async fn send(&self, body: &str) -> Result<MessageId, TransportError> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO queue_messages (queue, body) VALUES ($1, $2) RETURNING id")
                .bind(&self.queue)
                .bind(body)
                .fetch_one(&self.pool)
                .await?;
        Ok(MessageId::new(id))
    }

    /// Messages not yet completed or dead-lettered.
    pub async fn pending_count(&self) -> Result<u64, TransportError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = $1 AND dead_lettered_at IS NULL",
        )
        .bind(&self.queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Dead-lettered messages as `(id, reason)`, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<(MessageId, String)>, TransportError> {
        let rows = sqlx::query(
            r#"
            SELECT id, dead_letter_reason
            FROM queue_messages
            WHERE queue = $1 AND dead_lettered_at IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .bind(&self.queue)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    MessageId::new(row.try_get("id")?),
                    row.try_get::<Option<String>, _>("dead_letter_reason")?
                        .unwrap_or_default(),
                ))
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn settled(&self, rows_affected: u64, delivery: &Delivery) -> Result<(), TransportError> {
        if rows_affected == 0 {
            return Err(TransportError::LockLost(delivery.message_id));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for PostgresQueue {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn receive(&self) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;

        let lock_token = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET delivery_count = delivery_count + 1,
                visible_at = now() + make_interval(secs => $2),
                lock_token = $3
            WHERE id = (
                SELECT id
                FROM queue_messages
                WHERE queue = $1 AND dead_lettered_at IS NULL AND visible_at <= now()
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, body, delivery_count
            "#,
        )
        .bind(&self.queue)
        .bind(self.lock_duration.as_secs_f64())
        .bind(lock_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivery_count: i32 = row.try_get("delivery_count")?;
        Ok(Some(Delivery {
            message_id: MessageId::new(row.try_get("id")?),
            body: row.try_get("body")?,
            delivery_count: delivery_count.max(0) as u32,
            lock_token,
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND lock_token = $2")
            .bind(delivery.message_id.as_i64())
            .bind(delivery.lock_token)
            .execute(&self.pool)
            .await?;
        self.settled(result.rows_affected(), delivery)
    }

    async fn abandon(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_open()?;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = now(), lock_token = NULL
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(delivery.message_id.as_i64())
        .bind(delivery.lock_token)
        .execute(&self.pool)
        .await?;
        self.settled(result.rows_affected(), delivery)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET dead_lettered_at = now(), dead_letter_reason = $3, lock_token = NULL
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(delivery.message_id.as_i64())
        .bind(delivery.lock_token)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        self.settled(result.rows_affected(), delivery)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(queue = %self.queue, "closing queue client");
        self.pool.close().await;
        Ok(())
    }
}
