//! The long-running queue consumer and its start/stop lifecycle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use order_store::OrderStore;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broker::QueueClient;
use crate::error::IngestError;
use crate::handler::MessageHandler;

/// Lifecycle of a [`QueueConsumer`].
///
/// `Stopped → Starting → Running → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsumerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Stopped => write!(f, "Stopped"),
            ConsumerState::Starting => write!(f, "Starting"),
            ConsumerState::Running => write!(f, "Running"),
            ConsumerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on handlers in flight at once.
    pub max_concurrent_handlers: usize,
    /// Delay before polling again after an empty receive.
    pub poll_interval: Duration,
    /// Delay before receiving again after a transport error.
    pub receive_error_backoff: Duration,
    /// How long stop waits for in-flight handlers before aborting them.
    /// `None` waits for as long as they take.
    pub shutdown_grace: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 16,
            poll_interval: Duration::from_millis(500),
            receive_error_backoff: Duration::from_secs(1),
            shutdown_grace: Some(Duration::from_secs(30)),
        }
    }
}

/// Pulls deliveries from a queue and runs the handler on each of them.
///
/// The broker client is shared by the loop and every handler task, and is
/// closed exactly once when the consumer stops. A stopped consumer cannot be
/// run again; build a new one over a fresh client instead.
pub struct QueueConsumer<S: OrderStore + 'static> {
    client: Arc<dyn QueueClient>,
    handler: Arc<MessageHandler<S>>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    client_closed: AtomicBool,
}

impl<S: OrderStore + 'static> QueueConsumer<S> {
    pub fn new(
        client: Arc<dyn QueueClient>,
        handler: MessageHandler<S>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            client,
            handler: Arc::new(handler),
            config,
            state,
            client_closed: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = %previous, to = %next, "consumer state changed");
    }

    /// Runs the receive loop until `shutdown` is cancelled.
    ///
    /// A failing message never ends the loop. On shutdown no further
    /// messages are received, in-flight handlers are given
    /// [`ConsumerConfig::shutdown_grace`] to finish, and the client is closed.
    ///
    /// Fails with [`IngestError::AlreadyRunning`] while another call is
    /// active, and with [`IngestError::ClientClosed`] once a previous call has
    /// closed the client.
    #[tracing::instrument(skip_all, fields(queue = %self.client.queue_name()))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), IngestError> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            // Checked under the state lock: the flag is raised before the
            // final transition to Stopped.
            if self.client_closed.load(Ordering::Acquire) {
                refused = Some(IngestError::ClientClosed);
                return false;
            }
            if *state != ConsumerState::Stopped {
                refused = Some(IngestError::AlreadyRunning);
                return false;
            }
            *state = ConsumerState::Starting;
            true
        });
        if let Some(err) = refused {
            return Err(err);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_handlers.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        self.transition(ConsumerState::Running);
        tracing::info!(
            max_concurrent_handlers = self.config.max_concurrent_handlers,
            ack_mode = %self.handler.config().ack_mode,
            "consumer running"
        );

        loop {
            while let Some(result) = in_flight.try_join_next() {
                log_handler_exit(result);
            }

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if shutdown.is_cancelled() {
                break;
            }

            match self.client.receive().await {
                Ok(Some(delivery)) => {
                    let handler = Arc::clone(&self.handler);
                    let client = Arc::clone(&self.client);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        handler.handle(client.as_ref(), delivery).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if pause(&shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    metrics::counter!("ingest_receive_failures_total").increment(1);
                    tracing::error!(error = %e, "failed to receive message");
                    if pause(&shutdown, self.config.receive_error_backoff).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConsumerState::Stopping);
        tracing::info!(in_flight = in_flight.len(), "consumer stopping");
        self.drain(&mut in_flight).await;

        if let Err(e) = self.client.close().await {
            tracing::warn!(error = %e, "failed to close queue client");
        }
        self.client_closed.store(true, Ordering::Release);

        self.transition(ConsumerState::Stopped);
        tracing::info!("consumer stopped");
        Ok(())
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        let Some(grace) = self.config.shutdown_grace else {
            join_all(in_flight).await;
            return;
        };

        if tokio::time::timeout(grace, join_all(in_flight)).await.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                grace = ?grace,
                "shutdown grace period expired, aborting in-flight handlers"
            );
            in_flight.abort_all();
            join_all(in_flight).await;
        }
    }

    /// Runs the consumer on its own task.
    pub fn spawn(self, shutdown: CancellationToken) -> ConsumerHandle {
        let state = self.subscribe();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        ConsumerHandle {
            shutdown,
            state,
            task,
        }
    }
}

/// Sleeps for `delay`; returns true if shutdown was requested meanwhile.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

async fn join_all(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.join_next().await {
        log_handler_exit(result);
    }
}

fn log_handler_exit(result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => tracing::warn!("message handler aborted"),
        Err(e) => tracing::error!(error = %e, "message handler panicked"),
    }
}

/// Controls a consumer started with [`QueueConsumer::spawn`].
pub struct ConsumerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<(), IngestError>>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Waits until the consumer reaches `target`.
    pub async fn wait_for(&mut self, target: ConsumerState) {
        // The sender lives inside the consumer task; if it is gone the
        // consumer has finished and will never change state again.
        let _ = self.state.wait_for(|state| *state == target).await;
    }

    /// Requests shutdown and waits until the consumer has stopped.
    pub async fn stop(self) -> Result<(), IngestError> {
        self.shutdown.cancel();
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryQueue;
    use crate::handler::HandlerConfig;
    use crate::notify::RecordingNotifier;
    use order_store::{InMemoryOrderStore, OrderWriter};

    fn consumer(
        queue: &InMemoryQueue,
        store: &InMemoryOrderStore,
        config: ConsumerConfig,
    ) -> QueueConsumer<InMemoryOrderStore> {
        let handler = MessageHandler::new(
            OrderWriter::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
            HandlerConfig::default(),
        );
        QueueConsumer::new(Arc::new(queue.clone()), handler, config)
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            max_concurrent_handlers: 4,
            poll_interval: Duration::from_millis(5),
            receive_error_backoff: Duration::from_millis(5),
            shutdown_grace: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn starts_stopped() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        let consumer = consumer(&queue, &store, fast_config());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn walks_through_every_state() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        let consumer = consumer(&queue, &store, fast_config());

        let mut states = consumer.subscribe();
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == ConsumerState::Stopped {
                    break;
                }
            }
            seen
        });

        let shutdown = CancellationToken::new();
        let mut handle = consumer.spawn(shutdown);
        handle.wait_for(ConsumerState::Running).await;
        handle.stop().await.unwrap();

        // Watchers only see the latest value, so intermediate states may be
        // skipped; the final one never is.
        let seen = seen.await.unwrap();
        assert_eq!(seen.last(), Some(&ConsumerState::Stopped));
    }

    #[tokio::test]
    async fn run_twice_concurrently_is_rejected() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        let consumer = Arc::new(consumer(&queue, &store, fast_config()));

        let shutdown = CancellationToken::new();
        let first = {
            let consumer = Arc::clone(&consumer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        let mut states = consumer.subscribe();
        states
            .wait_for(|s| *s == ConsumerState::Running)
            .await
            .unwrap();

        assert!(matches!(
            consumer.run(CancellationToken::new()).await,
            Err(IngestError::AlreadyRunning)
        ));

        shutdown.cancel();
        first.await.unwrap().unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn stopped_consumer_refuses_to_run_again() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        let consumer = consumer(&queue, &store, fast_config());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        consumer.run(shutdown).await.unwrap();
        assert!(queue.is_closed());
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        let rerun = tokio::time::timeout(
            Duration::from_secs(1),
            consumer.run(CancellationToken::new()),
        )
        .await
        .expect("run on a closed client should return at once");

        assert!(matches!(rerun, Err(IngestError::ClientClosed)));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(queue.close_calls(), 1);
    }

    #[tokio::test]
    async fn receive_errors_do_not_stop_the_loop() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        queue.fail_next_receives(3);
        queue.send(
            r#"{"createdAt":"2023-05-01T10:00:00Z","customerId":1,"sellerId":1,"lineItems":[]}"#,
        );

        let mut handle = consumer(&queue, &store, fast_config()).spawn(CancellationToken::new());
        handle.wait_for(ConsumerState::Running).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.order_count().await.unwrap() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await.unwrap();
        assert!(queue.is_closed());
        assert_eq!(queue.close_calls(), 1);
    }

    #[tokio::test]
    async fn grace_period_aborts_stuck_handlers() {
        let queue = InMemoryQueue::new("orders");
        let store = InMemoryOrderStore::new();
        store.set_insert_delay(Some(Duration::from_secs(60)));
        queue.send(
            r#"{"createdAt":"2023-05-01T10:00:00Z","customerId":1,"sellerId":1}"#,
        );

        let config = ConsumerConfig {
            shutdown_grace: Some(Duration::from_millis(50)),
            ..fast_config()
        };
        let mut handle = consumer(&queue, &store, config).spawn(CancellationToken::new());
        handle.wait_for(ConsumerState::Running).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.open_units() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.order_count().await.unwrap(), 0);
        assert_eq!(store.open_units(), 0);
        assert!(queue.is_closed());
    }
}
