use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{FailureReport, Notifier};

#[derive(Debug, Default)]
struct RecordingState {
    reports: Vec<FailureReport>,
    failed_attempts: usize,
    fail: bool,
    delay: Option<Duration>,
}

/// Keeps every report in memory, for testing.
///
/// Can be told to fail delivery, or to be slow, to exercise the
/// never-escalate contract.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every delivery fail.
    pub fn set_fail(&self, fail: bool) {
        self.lock().fail = fail;
    }

    /// Delays every delivery.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Reports delivered so far.
    pub fn reports(&self) -> Vec<FailureReport> {
        self.lock().reports.clone()
    }

    /// Deliveries that failed.
    pub fn failed_attempts(&self) -> usize {
        self.lock().failed_attempts
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, report: &FailureReport) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail {
            state.failed_attempts += 1;
            tracing::warn!(message_id = %report.message_id, "notification channel unavailable");
            return;
        }
        state.reports.push(report.clone());
    }
}
