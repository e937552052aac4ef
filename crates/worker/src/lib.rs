//! Order ingest worker.
//!
//! Wires the Postgres order store, the Postgres queue, and a failure
//! notifier into a [`QueueConsumer`], and serves `/health` and `/metrics`
//! next to it until shutdown.

pub mod config;
pub mod error;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use ingest::{
    ConsumerState, LogNotifier, MessageHandler, Notifier, PostgresQueue, QueueClient,
    QueueConsumer, WebhookNotifier,
};
use metrics_exporter_prometheus::PrometheusHandle;
use order_store::{OrderStore, OrderWriter, PostgresOrderStore};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::WorkerError;

use routes::OpsState;

/// Creates the router for the health and metrics endpoints.
pub fn create_ops_app(consumer: watch::Receiver<ConsumerState>, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .with_state(OpsState { consumer, metrics })
        .layer(TraceLayer::new_for_http())
}

/// Picks the webhook notifier when a URL is configured, the log otherwise.
pub fn create_notifier(config: &Config) -> Arc<dyn Notifier> {
    match &config.notify_url {
        Some(url) => {
            tracing::info!(%url, "failure reports go to webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => {
            tracing::info!("no NOTIFY_URL set, failure reports go to the log");
            Arc::new(LogNotifier::new())
        }
    }
}

/// Builds a consumer over any store and queue.
pub fn create_consumer<S: OrderStore + 'static>(
    config: &Config,
    store: S,
    queue: Arc<dyn QueueClient>,
    notifier: Arc<dyn Notifier>,
) -> QueueConsumer<S> {
    let writer = OrderWriter::new(store)
        .with_mode(config.persist_mode)
        .with_timeout(Some(config.persist_timeout));
    let handler = MessageHandler::new(writer, notifier, config.handler_config());
    QueueConsumer::new(queue, handler, config.consumer_config())
}

async fn connect_pool(
    target: &'static str,
    url: &str,
    config: &Config,
) -> Result<PgPool, WorkerError> {
    let connect = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect(url);

    match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(pool)) => {
            tracing::info!(target_db = target, "connected");
            Ok(pool)
        }
        Ok(Err(source)) => Err(WorkerError::Connect { target, source }),
        Err(_) => Err(WorkerError::ConnectTimeout {
            target,
            timeout: config.connect_timeout,
        }),
    }
}

/// Registers descriptions for the metrics the pipeline records.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "ingest_messages_received_total",
        "Deliveries handed to the message handler"
    );
    metrics::describe_counter!(
        "ingest_messages_persisted_total",
        "Messages whose order and line items were stored"
    );
    metrics::describe_counter!(
        "ingest_decode_failures_total",
        "Messages whose payload could not be decoded"
    );
    metrics::describe_counter!(
        "ingest_persist_failures_total",
        "Decoded messages that failed to persist"
    );
    metrics::describe_counter!(
        "ingest_receive_failures_total",
        "Broker receive or acknowledge failures"
    );
    metrics::describe_counter!(
        "ingest_dead_lettered_total",
        "Messages moved to the dead-letter store"
    );
    metrics::describe_counter!(
        "ingest_notifications_failed_total",
        "Failure reports that could not be delivered"
    );
    metrics::describe_histogram!(
        "order_store_persist_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent persisting one document"
    );
    metrics::describe_counter!(
        "order_store_persist_failures_total",
        "Documents the writer failed to persist"
    );
    metrics::describe_counter!(
        "order_store_orders_inserted_total",
        "Order rows inserted"
    );
    metrics::describe_counter!(
        "order_store_line_items_inserted_total",
        "Line item rows inserted"
    );
}

/// Runs the worker until `shutdown_signal` resolves, then drains the
/// consumer and stops the ops server.
pub async fn run<F>(
    config: Config,
    metrics: PrometheusHandle,
    shutdown_signal: F,
) -> Result<(), WorkerError>
where
    F: Future<Output = ()> + Send,
{
    describe_metrics();

    let store = PostgresOrderStore::new(connect_pool("order store", &config.database_url, &config).await?);
    if config.run_migrations {
        tracing::info!("running migrations");
        store.run_migrations().await?;
    }

    let queue_pool = connect_pool("queue", &config.queue_url, &config).await?;
    let queue: Arc<dyn QueueClient> =
        Arc::new(PostgresQueue::new(queue_pool, config.queue_name.clone()));

    let addr = config.metrics_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "serving health and metrics");

    let consumer = create_consumer(&config, store, queue, create_notifier(&config));
    let shutdown = CancellationToken::new();
    let handle = consumer.spawn(shutdown.clone());

    let app = create_ops_app(handle.subscribe(), metrics);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tracing::info!(
        queue = %config.queue_name,
        ack_mode = %config.ack_mode,
        persist_mode = %config.persist_mode,
        "order ingest worker started"
    );

    shutdown_signal.await;
    tracing::info!("stopping consumer");
    let stopped = handle.stop().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "ops server failed"),
        Err(e) => tracing::warn!(error = %e, "ops server task failed"),
    }

    stopped?;
    tracing::info!("worker shut down gracefully");
    Ok(())
}
