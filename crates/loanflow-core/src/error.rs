use crate::phase::LoanPhase;
use thiserror::Error;

/// Engine and storage errors, surfaced to callers as typed results.
#[derive(Debug, Error)]
pub enum LoanFlowError {
    #[error("loan not found")]
    NotFound,

    #[error("operation requires phase '{expected}', loan is '{actual}'")]
    WrongPhase {
        expected: LoanPhase,
        actual: LoanPhase,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("contribution exceeds remaining capacity of {remaining_minor}")]
    ExceedsRemainingCapacity { remaining_minor: i64 },

    #[error("contributor '{contributor_id}' already contributed to this loan")]
    DuplicateContributor { contributor_id: String },

    /// Fatal consistency failure: the stored total and the ledger disagree.
    /// Mutation of the affected loan must halt pending reconciliation.
    #[error("total mismatch: expected {expected_minor}, found {actual_minor}")]
    TotalMismatch {
        expected_minor: i64,
        actual_minor: i64,
    },

    /// Per-loan exclusive section not acquired within the bounded wait.
    #[error("loan is busy: {0}")]
    Busy(String),

    /// Compare-and-set lost to a concurrent phase transition.
    #[error("phase conflict: a concurrent transition won")]
    Conflict,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("audit trail error: {0}")]
    History(String),
}

impl LoanFlowError {
    pub fn wrong_phase(expected: LoanPhase, actual: LoanPhase) -> Self {
        Self::WrongPhase { expected, actual }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// True for contention errors the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Conflict)
    }
}
