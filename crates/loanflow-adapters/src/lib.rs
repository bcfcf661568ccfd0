//! Notification adapters for loanflow.
//!
//! The engine emits one [`FundedNotification`] per contributor when a loan
//! becomes funded; these adapters decide what delivery means. Real
//! deployments plug an email or webhook sink in here.

#![deny(unsafe_code)]

use async_trait::async_trait;
use loanflow_core::{FundedNotification, FundedNotifier, LoanFlowError};
use tokio::sync::Mutex;
use tracing::info;

/// Recording notifier for tests and local development. Captures every
/// delivered notice instead of sending anything.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<FundedNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<FundedNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl FundedNotifier for RecordingNotifier {
    async fn notify_funded(&self, notice: &FundedNotification) -> Result<(), LoanFlowError> {
        self.sent.lock().await.push(notice.clone());
        Ok(())
    }
}

/// Notifier that logs each delivery through `tracing`. Default sink for the
/// service binary when no real transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl FundedNotifier for LogNotifier {
    async fn notify_funded(&self, notice: &FundedNotification) -> Result<(), LoanFlowError> {
        info!(
            contributor = %notice.contributor_id,
            loan_ref = %notice.loan_ref,
            reference_link = %notice.reference_link,
            "loan fully funded; contributor notification emitted"
        );
        Ok(())
    }
}

/// Deterministic failing notifier useful for chaos testing the engine's
/// delivery-failure path.
#[derive(Debug, Clone)]
pub struct AlwaysFailNotifier {
    reason: String,
}

impl AlwaysFailNotifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl FundedNotifier for AlwaysFailNotifier {
    async fn notify_funded(&self, _notice: &FundedNotification) -> Result<(), LoanFlowError> {
        Err(LoanFlowError::Storage(self.reason.clone()))
    }
}
