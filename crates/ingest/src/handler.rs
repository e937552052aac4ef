//! Per-message processing: acknowledge, decode, persist, report.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use order_store::{OrderStore, OrderWriter, PersistedOrder};

use crate::broker::{Delivery, QueueClient};
use crate::error::ProcessingError;
use crate::notify::{FailureReport, FailureStage, Notifier};

/// When a message is acknowledged relative to processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Complete the message before decoding it. A message that later fails
    /// to decode or persist is gone from the broker and survives only in the
    /// failure report (best-effort delivery).
    #[default]
    BeforeProcess,
    /// Complete the message only after it was persisted. Undecodable
    /// messages are dead-lettered at once; persistence failures are retried
    /// until `max_deliveries` and then dead-lettered (at-least-once delivery).
    AfterPersist,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::BeforeProcess => write!(f, "before-process"),
            AckMode::AfterPersist => write!(f, "after-persist"),
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before-process" | "before_process" => Ok(AckMode::BeforeProcess),
            "after-persist" | "after_persist" => Ok(AckMode::AfterPersist),
            other => Err(format!("unknown ack mode '{other}'")),
        }
    }
}

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub ack_mode: AckMode,
    /// Deliveries after which an [`AckMode::AfterPersist`] message that keeps
    /// failing to persist is dead-lettered. A failure that left an orphaned
    /// order is dead-lettered on the spot, since a redelivery would store the
    /// order a second time.
    pub max_deliveries: u32,
    /// Bound on a single notifier call. `None` waits for it indefinitely.
    pub notify_timeout: Option<Duration>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            max_deliveries: 5,
            notify_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// What happened to a message that failed processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// It was completed before processing and cannot be redelivered.
    AlreadyAcknowledged,
    /// It was released for redelivery.
    Abandoned,
    /// It was moved to the dead-letter store.
    DeadLettered,
    /// Settling it with the broker failed; the broker decides what happens.
    SettleFailed,
}

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Persisted(PersistedOrder),
    Failed {
        stage: FailureStage,
        disposition: Disposition,
    },
    /// The message could not be acknowledged and was not processed.
    AckFailed,
}

/// Processes single deliveries.
///
/// Every invocation decodes into its own document and opens its own units of
/// work, so any number of invocations can run concurrently.
pub struct MessageHandler<S: OrderStore> {
    writer: OrderWriter<S>,
    notifier: Arc<dyn Notifier>,
    config: HandlerConfig,
}

impl<S: OrderStore> MessageHandler<S> {
    pub fn new(writer: OrderWriter<S>, notifier: Arc<dyn Notifier>, config: HandlerConfig) -> Self {
        Self {
            writer,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn writer(&self) -> &OrderWriter<S> {
        &self.writer
    }

    /// Handles one delivery. Never fails: every error is either logged or
    /// routed to the notifier.
    #[tracing::instrument(
        skip(self, client, delivery),
        fields(
            queue = %client.queue_name(),
            message_id = %delivery.message_id,
            delivery_count = delivery.delivery_count
        )
    )]
    pub async fn handle(&self, client: &dyn QueueClient, delivery: Delivery) -> Outcome {
        metrics::counter!("ingest_messages_received_total").increment(1);

        if self.config.ack_mode == AckMode::BeforeProcess
            && let Err(e) = client.complete(&delivery).await
        {
            metrics::counter!("ingest_receive_failures_total").increment(1);
            tracing::error!(error = %e, "failed to acknowledge message, skipping it");
            return Outcome::AckFailed;
        }

        match self.process(&delivery.body).await {
            Ok(persisted) => {
                metrics::counter!("ingest_messages_persisted_total").increment(1);
                tracing::info!(
                    order_id = %persisted.order_id,
                    line_items = persisted.line_items,
                    "order ingested"
                );

                if self.config.ack_mode == AckMode::AfterPersist
                    && let Err(e) = client.complete(&delivery).await
                {
                    // The order is stored; a redelivery would insert it again.
                    tracing::error!(
                        error = %e,
                        order_id = %persisted.order_id,
                        "failed to acknowledge persisted message"
                    );
                }
                Outcome::Persisted(persisted)
            }
            Err(e) => {
                let stage = e.stage();
                match stage {
                    FailureStage::Decode => {
                        metrics::counter!("ingest_decode_failures_total").increment(1)
                    }
                    FailureStage::Persist => {
                        metrics::counter!("ingest_persist_failures_total").increment(1)
                    }
                }
                tracing::warn!(error = %e, %stage, "message processing failed");

                let report = FailureReport::new(client.queue_name(), &delivery, &e);
                self.notify(&report).await;

                let disposition = self.settle_failure(client, &delivery, &e).await;
                Outcome::Failed { stage, disposition }
            }
        }
    }

    async fn process(&self, body: &str) -> Result<PersistedOrder, ProcessingError> {
        let doc = order_model::decode(body)?;
        Ok(self.writer.persist(doc).await?)
    }

    async fn notify(&self, report: &FailureReport) {
        match self.config.notify_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.notifier.notify(report))
                    .await
                    .is_err()
                {
                    metrics::counter!("ingest_notifications_failed_total").increment(1);
                    tracing::warn!(timeout = ?limit, "failure notification timed out");
                }
            }
            None => self.notifier.notify(report).await,
        }
    }

    async fn settle_failure(
        &self,
        client: &dyn QueueClient,
        delivery: &Delivery,
        error: &ProcessingError,
    ) -> Disposition {
        if self.config.ack_mode == AckMode::BeforeProcess {
            return Disposition::AlreadyAcknowledged;
        }

        let orphan = error.orphaned_order();
        let retry = error.stage() == FailureStage::Persist
            && orphan.is_none()
            && delivery.delivery_count < self.config.max_deliveries;

        if let Some(order_id) = orphan {
            tracing::warn!(%order_id, "order committed without line items, not redelivering");
        }

        let (result, disposition) = if retry {
            (client.abandon(delivery).await, Disposition::Abandoned)
        } else {
            metrics::counter!("ingest_dead_lettered_total").increment(1);
            (
                client.dead_letter(delivery, &error.to_string()).await,
                Disposition::DeadLettered,
            )
        };

        match result {
            Ok(()) => disposition,
            Err(e) => {
                tracing::error!(error = %e, ?disposition, "failed to settle failed message");
                Disposition::SettleFailed
            }
        }
    }
}
