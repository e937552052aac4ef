use async_trait::async_trait;

use super::{FailureReport, Notifier};

/// Writes failure reports to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &FailureReport) {
        tracing::error!(
            queue = %report.queue,
            message_id = %report.message_id,
            delivery_count = report.delivery_count,
            stage = %report.stage,
            error = %report.error,
            "{}",
            report.summary()
        );
    }
}
