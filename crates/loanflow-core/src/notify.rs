use crate::error::LoanFlowError;
use crate::types::FundedNotification;
use async_trait::async_trait;

/// Downstream notification sink, invoked once per contributor on the
/// funding transition.
///
/// Delivery, retries, and transport are the implementor's concern. The
/// engine logs a failed delivery and moves on; it never rolls back or blocks
/// a funding transition on notification failure.
#[async_trait]
pub trait FundedNotifier: Send + Sync {
    async fn notify_funded(&self, notice: &FundedNotification) -> Result<(), LoanFlowError>;
}

/// Notifier that drops every event. Default for engines that have no
/// downstream consumer wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl FundedNotifier for NoopNotifier {
    async fn notify_funded(&self, _notice: &FundedNotification) -> Result<(), LoanFlowError> {
        Ok(())
    }
}
