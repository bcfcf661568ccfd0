use crate::error::LoanFlowError;
use crate::history::PhaseTransition;
use crate::phase::LoanPhase;
use crate::types::{ApprovalEvidence, Contribution, DisbursementEvidence, Loan, NewLoan};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage backend configuration.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep all loans, contributions, and transition records in process
    /// memory only.
    Memory,
    /// Persist everything in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Outcome of an atomic contribution insert.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Accepted(Contribution),
    /// The (loan, contributor) pair already has a row.
    DuplicateContributor,
}

/// Durable record of each loan's identity, target, and current phase.
///
/// `compare_and_set_phase` is the concurrency anchor: all phase advancement
/// goes through it, so two callers racing to advance the same loan cannot
/// both succeed even if they bypass the engine's per-loan lock.
#[async_trait]
pub trait LoanStore: Send + Sync {
    /// Insert a new loan in `proposed` with a zero total. Input is validated
    /// by the engine before it reaches the store.
    async fn create(&self, new_loan: NewLoan) -> Result<Loan, LoanFlowError>;

    async fn get(&self, id: i64) -> Result<Loan, LoanFlowError>;

    async fn get_by_ref(&self, loan_ref: Uuid) -> Result<Loan, LoanFlowError>;

    /// Newest first, optionally filtered by phase.
    async fn list(
        &self,
        phase: Option<LoanPhase>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Loan>, LoanFlowError>;

    async fn delete(&self, id: i64) -> Result<(), LoanFlowError>;

    /// Succeeds only when the stored phase still equals `expected`;
    /// otherwise fails with [`LoanFlowError::Conflict`].
    async fn compare_and_set_phase(
        &self,
        id: i64,
        expected: LoanPhase,
        new: LoanPhase,
    ) -> Result<(), LoanFlowError>;

    /// Add `delta_minor` to the accumulated total and return the new total.
    async fn add_to_total(&self, id: i64, delta_minor: i64) -> Result<i64, LoanFlowError>;

    async fn put_approval(
        &self,
        loan_id: i64,
        evidence: &ApprovalEvidence,
    ) -> Result<(), LoanFlowError>;

    async fn get_approval(&self, loan_id: i64)
        -> Result<Option<ApprovalEvidence>, LoanFlowError>;

    async fn put_disbursement(
        &self,
        loan_id: i64,
        evidence: &DisbursementEvidence,
    ) -> Result<(), LoanFlowError>;

    async fn get_disbursement(
        &self,
        loan_id: i64,
    ) -> Result<Option<DisbursementEvidence>, LoanFlowError>;
}

/// Durable, append-only record of accepted contributions.
#[async_trait]
pub trait ContributionLedger: Send + Sync {
    /// Insert a contribution row. The uniqueness of (loan, contributor) is
    /// checked atomically with the insertion; a check-then-insert race must
    /// not allow two rows for the same pair.
    async fn try_record(
        &self,
        loan_id: i64,
        contributor_id: &str,
        amount_minor: i64,
    ) -> Result<RecordOutcome, LoanFlowError>;

    /// Authoritative recomputation of the accumulated total, usable to
    /// detect and repair drift against the loan's stored total.
    async fn sum_for(&self, loan_id: i64) -> Result<i64, LoanFlowError>;

    async fn list_for(&self, loan_id: i64) -> Result<Vec<Contribution>, LoanFlowError>;
}

/// Append-only audit trail of phase transitions, hash-chained per loan.
#[async_trait]
pub trait TransitionLog: Send + Sync {
    async fn append(
        &self,
        loan_id: i64,
        previous_phase: LoanPhase,
        new_phase: LoanPhase,
        reason: &str,
    ) -> Result<PhaseTransition, LoanFlowError>;

    /// Ordered history for one loan, verified against the hash chain.
    async fn list_for(&self, loan_id: i64) -> Result<Vec<PhaseTransition>, LoanFlowError>;
}
