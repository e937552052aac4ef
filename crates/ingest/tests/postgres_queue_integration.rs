//! PostgreSQL queue integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p ingest --test postgres_queue_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use ingest::{
    AckMode, ConsumerConfig, ConsumerState, HandlerConfig, MessageHandler, PostgresQueue,
    QueueClient, QueueConsumer, RecordingNotifier, TransportError,
};
use order_store::{MIGRATOR, OrderStore, OrderWriter, PostgresOrderStore};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            MIGRATOR.run(&temp_pool).await.unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A queue named after the test, so tests never see each other's messages.
async fn get_test_queue(name: &str) -> PostgresQueue {
    let info = get_container_info().await;
    let queue = PostgresQueue::connect(&info.connection_string, name, 5)
        .await
        .unwrap();

    sqlx::query("DELETE FROM queue_messages WHERE queue = $1")
        .bind(name)
        .execute(queue.pool())
        .await
        .unwrap();

    queue
}

async fn get_test_store() -> PostgresOrderStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE order_line_items, orders RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresOrderStore::new(pool)
}

#[tokio::test]
async fn receive_leases_and_complete_removes() {
    let queue = get_test_queue("lease-complete").await;
    let id = queue.send("hello").await.unwrap();

    let delivery = queue.receive().await.unwrap().unwrap();
    assert_eq!(delivery.message_id, id);
    assert_eq!(delivery.body, "hello");
    assert_eq!(delivery.delivery_count, 1);

    // Leased, so invisible to other receivers.
    assert!(queue.receive().await.unwrap().is_none());

    queue.complete(&delivery).await.unwrap();
    assert_eq!(queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn abandon_makes_message_visible_again() {
    let queue = get_test_queue("abandon").await;
    queue.send("retry me").await.unwrap();

    let first = queue.receive().await.unwrap().unwrap();
    queue.abandon(&first).await.unwrap();

    let second = queue.receive().await.unwrap().unwrap();
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert_ne!(second.lock_token, first.lock_token);
}

#[tokio::test]
async fn stale_lease_cannot_settle() {
    let queue = get_test_queue("stale-lease")
        .await
        .with_lock_duration(Duration::from_millis(50));
    queue.send("slow").await.unwrap();

    let stale = queue.receive().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fresh = queue.receive().await.unwrap().unwrap();
    assert_eq!(fresh.message_id, stale.message_id);

    assert!(matches!(
        queue.complete(&stale).await,
        Err(TransportError::LockLost(_))
    ));
    queue.complete(&fresh).await.unwrap();
}

#[tokio::test]
async fn dead_letter_keeps_reason_and_stops_delivery() {
    let queue = get_test_queue("dead-letter").await;
    let id = queue.send("poison").await.unwrap();

    let delivery = queue.receive().await.unwrap().unwrap();
    queue.dead_letter(&delivery, "undecodable").await.unwrap();

    assert!(queue.receive().await.unwrap().is_none());
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert_eq!(
        queue.dead_letters().await.unwrap(),
        vec![(id, "undecodable".to_string())]
    );
}

#[tokio::test]
async fn closed_queue_rejects_calls() {
    let queue = get_test_queue("closed").await;

    queue.close().await.unwrap();
    queue.close().await.unwrap();

    assert!(matches!(queue.receive().await, Err(TransportError::Closed)));
}

#[tokio::test]
async fn consumer_ingests_from_postgres_queue_into_postgres_store() {
    let queue = Arc::new(get_test_queue("end-to-end").await);
    let store = get_test_store().await;
    let notifier = RecordingNotifier::new();

    queue
        .send(
            r#"{"createdAt":"2023-05-01T10:00:00+02:00","customerId":42,"sellerId":7,
                "lineItems":[{"productId":"SKU-1","quantity":2,"unitPriceCents":1250},
                             {"productId":"SKU-2","quantity":1,"unitPriceCents":399}]}"#,
        )
        .await
        .unwrap();
    queue.send("not an order").await.unwrap();

    let handler = MessageHandler::new(
        OrderWriter::new(store.clone()),
        Arc::new(notifier.clone()),
        HandlerConfig {
            ack_mode: AckMode::AfterPersist,
            ..HandlerConfig::default()
        },
    );
    let config = ConsumerConfig {
        poll_interval: Duration::from_millis(20),
        ..ConsumerConfig::default()
    };
    let mut handle = QueueConsumer::new(queue.clone(), handler, config)
        .spawn(CancellationToken::new());
    handle.wait_for(ConsumerState::Running).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = store.order_count().await.unwrap() == 1
                && queue.dead_letters().await.unwrap().len() == 1
                && queue.pending_count().await.unwrap() == 0;
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(store.line_item_count().await.unwrap(), 2);
    assert_eq!(notifier.reports().len(), 1);

    handle.stop().await.unwrap();
    assert!(queue.pool().is_closed());
}
