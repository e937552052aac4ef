use async_trait::async_trait;

use super::{FailureReport, Notifier};
use crate::error::NotificationError;

/// POSTs failure reports as JSON to a configured address.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, report: &FailureReport) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "subject": report.summary(),
                "report": report,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &FailureReport) {
        if let Err(e) = self.send(report).await {
            metrics::counter!("ingest_notifications_failed_total").increment(1);
            tracing::warn!(
                error = %e,
                url = %self.url,
                message_id = %report.message_id,
                "failed to deliver failure notification"
            );
        }
    }
}
