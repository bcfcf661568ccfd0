use crate::error::LoanFlowError;
use crate::history::PhaseTransition;
use crate::memory::{MemoryContributionLedger, MemoryLoanStore, MemoryTransitionLog};
use crate::notify::FundedNotifier;
use crate::phase::LoanPhase;
use crate::postgres::{self, PgContributionLedger, PgLoanStore, PgTransitionLog};
use crate::store::{ContributionLedger, LoanStore, RecordOutcome, StorageConfig, TransitionLog};
use crate::types::{
    ApprovalEvidence, Contribution, ContributionReceipt, DisbursementEvidence,
    FundedNotification, Loan, NewLoan,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

/// Transition engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on waiting for a loan's exclusive section. A mutation that
    /// cannot acquire it within this window fails with the retryable
    /// [`LoanFlowError::Busy`] instead of blocking indefinitely.
    pub lock_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(5),
        }
    }
}

/// Read-only reconciliation of a loan's stored total against the
/// authoritative ledger sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalsReport {
    pub loan_id: i64,
    pub stored_minor: i64,
    pub ledger_minor: i64,
    pub consistent: bool,
}

/// Orchestrator for the loan lifecycle.
///
/// Owns its collaborators explicitly; there is no package-level shared
/// state. All mutation of a loan's phase, total, contribution rows, and
/// transition records happens inside that loan's exclusive section, so the
/// validate-then-write unit is never split across interleaved callers.
/// Reads never take the exclusive section.
pub struct TransitionEngine {
    loans: Arc<dyn LoanStore>,
    contributions: Arc<dyn ContributionLedger>,
    transitions: Arc<dyn TransitionLog>,
    notifier: Arc<dyn FundedNotifier>,
    loan_locks: StdMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    storage_label: &'static str,
    config: EngineConfig,
}

impl TransitionEngine {
    pub fn new(
        loans: Arc<dyn LoanStore>,
        contributions: Arc<dyn ContributionLedger>,
        transitions: Arc<dyn TransitionLog>,
        notifier: Arc<dyn FundedNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            loans,
            contributions,
            transitions,
            notifier,
            loan_locks: StdMutex::new(HashMap::new()),
            storage_label: "custom",
            config,
        }
    }

    /// Bootstrap the engine against a storage configuration.
    pub async fn bootstrap(
        storage: StorageConfig,
        notifier: Arc<dyn FundedNotifier>,
        config: EngineConfig,
    ) -> Result<Self, LoanFlowError> {
        let storage_label = storage.label();
        let (loans, contributions, transitions): (
            Arc<dyn LoanStore>,
            Arc<dyn ContributionLedger>,
            Arc<dyn TransitionLog>,
        ) = match storage {
            StorageConfig::Memory => (
                Arc::new(MemoryLoanStore::new()),
                Arc::new(MemoryContributionLedger::new()),
                Arc::new(MemoryTransitionLog::new()),
            ),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = postgres::connect(&database_url, max_connections).await?;
                postgres::ensure_schema(&pool).await?;
                (
                    Arc::new(PgLoanStore::new(pool.clone())),
                    Arc::new(PgContributionLedger::new(pool.clone())),
                    Arc::new(PgTransitionLog::new(pool)),
                )
            }
        };

        Ok(Self {
            loans,
            contributions,
            transitions,
            notifier,
            loan_locks: StdMutex::new(HashMap::new()),
            storage_label,
            config,
        })
    }

    pub fn storage_label(&self) -> &'static str {
        self.storage_label
    }

    /// Acquire the per-loan exclusive section with a bounded wait.
    async fn exclusive(&self, loan_id: i64) -> Result<OwnedMutexGuard<()>, LoanFlowError> {
        let slot = {
            let mut table = self
                .loan_locks
                .lock()
                .map_err(|_| LoanFlowError::Storage("loan lock table poisoned".to_string()))?;
            table
                .entry(loan_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        timeout(self.config.lock_wait, slot.lock_owned())
            .await
            .map_err(|_| {
                LoanFlowError::Busy(format!(
                    "loan {loan_id} mutation lock not acquired within {}ms",
                    self.config.lock_wait.as_millis()
                ))
            })
    }

    pub async fn create_loan(&self, new_loan: NewLoan) -> Result<Loan, LoanFlowError> {
        if new_loan.principal_minor <= 0 {
            return Err(LoanFlowError::invalid_input(
                "principal amount must be positive",
            ));
        }
        if !(0.0..=100.0).contains(&new_loan.rate) {
            return Err(LoanFlowError::invalid_input("rate must be between 0 and 100"));
        }
        if !(0.0..=100.0).contains(&new_loan.roi) {
            return Err(LoanFlowError::invalid_input("roi must be between 0 and 100"));
        }
        self.loans.create(new_loan).await
    }

    pub async fn get_loan(&self, id: i64) -> Result<Loan, LoanFlowError> {
        self.loans.get(id).await
    }

    pub async fn get_loan_by_ref(&self, loan_ref: Uuid) -> Result<Loan, LoanFlowError> {
        self.loans.get_by_ref(loan_ref).await
    }

    pub async fn list_loans(
        &self,
        phase: Option<LoanPhase>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Loan>, LoanFlowError> {
        self.loans.list(phase, offset, limit).await
    }

    /// Deletion is permitted only while a loan is still `proposed`.
    pub async fn delete_loan(&self, id: i64) -> Result<(), LoanFlowError> {
        let _guard = self.exclusive(id).await?;
        let loan = self.loans.get(id).await?;
        if loan.phase != LoanPhase::Proposed {
            return Err(LoanFlowError::wrong_phase(LoanPhase::Proposed, loan.phase));
        }
        self.loans.delete(id).await
    }

    /// Advance `proposed -> approved` on field-validation evidence.
    pub async fn approve(
        &self,
        id: i64,
        evidence: ApprovalEvidence,
    ) -> Result<Loan, LoanFlowError> {
        if evidence.validator_employee_id.trim().is_empty() {
            return Err(LoanFlowError::invalid_input(
                "field validator employee id is required",
            ));
        }
        if evidence.proof_image_url.trim().is_empty() {
            return Err(LoanFlowError::invalid_input("proof image url is required"));
        }

        let _guard = self.exclusive(id).await?;
        let loan = self.loans.get(id).await?;
        if loan.phase != LoanPhase::Proposed {
            return Err(LoanFlowError::wrong_phase(LoanPhase::Proposed, loan.phase));
        }

        self.loans.put_approval(id, &evidence).await?;
        // All phase writers hold the loan lock, so a conflict here means an
        // out-of-band writer; the CAS keeps it from being silently absorbed.
        self.loans
            .compare_and_set_phase(id, LoanPhase::Proposed, LoanPhase::Approved)
            .await?;
        self.transitions
            .append(
                id,
                LoanPhase::Proposed,
                LoanPhase::Approved,
                "approved by field validator",
            )
            .await?;

        self.loans.get(id).await
    }

    /// Record a contribution against an `approved` loan.
    ///
    /// The capacity check and the total update are evaluated inside the same
    /// exclusive section, so concurrent contributions cannot each pass a
    /// remaining-capacity check that together overshoots the principal. The
    /// call whose acceptance brings the total to the principal also performs
    /// the single `approved -> funded` transition and the notification
    /// fan-out.
    pub async fn contribute(
        &self,
        id: i64,
        contributor_id: &str,
        amount_minor: i64,
    ) -> Result<ContributionReceipt, LoanFlowError> {
        if contributor_id.trim().is_empty() {
            return Err(LoanFlowError::invalid_input("contributor id is required"));
        }
        if amount_minor <= 0 {
            return Err(LoanFlowError::invalid_input(
                "contribution amount must be positive",
            ));
        }

        let _guard = self.exclusive(id).await?;
        let loan = self.loans.get(id).await?;
        if loan.phase != LoanPhase::Approved {
            return Err(LoanFlowError::wrong_phase(LoanPhase::Approved, loan.phase));
        }

        let remaining = loan.remaining_capacity_minor();
        if amount_minor > remaining {
            return Err(LoanFlowError::ExceedsRemainingCapacity {
                remaining_minor: remaining,
            });
        }

        let contribution = match self
            .contributions
            .try_record(id, contributor_id, amount_minor)
            .await?
        {
            RecordOutcome::Accepted(contribution) => contribution,
            RecordOutcome::DuplicateContributor => {
                return Err(LoanFlowError::DuplicateContributor {
                    contributor_id: contributor_id.to_string(),
                })
            }
        };

        let new_total = self.loans.add_to_total(id, amount_minor).await?;
        debug_assert!(new_total <= loan.principal_minor);

        let funded = new_total >= loan.principal_minor;
        if funded {
            self.loans
                .compare_and_set_phase(id, LoanPhase::Approved, LoanPhase::Funded)
                .await?;
            self.transitions
                .append(id, LoanPhase::Approved, LoanPhase::Funded, "fully funded")
                .await?;
            self.fan_out_funded(&loan).await?;
        }

        Ok(ContributionReceipt {
            contribution,
            loan: self.loans.get(id).await?,
            funded,
        })
    }

    /// Emit one notification event per contributor of a freshly funded loan.
    ///
    /// Runs only on the call that won the funding CAS, so the fan-out
    /// happens at most once per loan. Delivery failures are logged and do
    /// not roll back the transition.
    async fn fan_out_funded(&self, loan: &Loan) -> Result<(), LoanFlowError> {
        let rows = self.contributions.list_for(loan.id).await?;
        for row in rows {
            let notice = FundedNotification {
                contributor_id: row.contributor_id.clone(),
                loan_ref: loan.loan_ref,
                reference_link: loan.agreement_letter_link.clone(),
            };
            if let Err(err) = self.notifier.notify_funded(&notice).await {
                warn!(
                    loan_ref = %loan.loan_ref,
                    contributor = %row.contributor_id,
                    error = %err,
                    "funded notification delivery failed"
                );
            }
        }
        Ok(())
    }

    /// Advance `funded -> disbursed` on disbursement evidence.
    ///
    /// Re-checks both total equalities before moving money out: the stored
    /// total must equal the principal, and the ledger must agree with the
    /// stored total. Either miss halts the loan with the fatal
    /// `TotalMismatch`.
    pub async fn disburse(
        &self,
        id: i64,
        evidence: DisbursementEvidence,
    ) -> Result<Loan, LoanFlowError> {
        if evidence.officer_employee_id.trim().is_empty() {
            return Err(LoanFlowError::invalid_input(
                "field officer employee id is required",
            ));
        }
        if evidence.signed_agreement_url.trim().is_empty() {
            return Err(LoanFlowError::invalid_input(
                "signed agreement url is required",
            ));
        }

        let _guard = self.exclusive(id).await?;
        let loan = self.loans.get(id).await?;
        if loan.phase != LoanPhase::Funded {
            return Err(LoanFlowError::wrong_phase(LoanPhase::Funded, loan.phase));
        }

        if loan.total_contributed_minor != loan.principal_minor {
            warn!(
                loan_ref = %loan.loan_ref,
                stored = loan.total_contributed_minor,
                principal = loan.principal_minor,
                "stored total does not match principal; halting disbursement"
            );
            return Err(LoanFlowError::TotalMismatch {
                expected_minor: loan.principal_minor,
                actual_minor: loan.total_contributed_minor,
            });
        }

        let ledger_total = self.contributions.sum_for(id).await?;
        if ledger_total != loan.total_contributed_minor {
            warn!(
                loan_ref = %loan.loan_ref,
                stored = loan.total_contributed_minor,
                ledger = ledger_total,
                "ledger drift detected; halting disbursement"
            );
            return Err(LoanFlowError::TotalMismatch {
                expected_minor: loan.total_contributed_minor,
                actual_minor: ledger_total,
            });
        }

        self.loans.put_disbursement(id, &evidence).await?;
        self.loans
            .compare_and_set_phase(id, LoanPhase::Funded, LoanPhase::Disbursed)
            .await?;
        self.transitions
            .append(
                id,
                LoanPhase::Funded,
                LoanPhase::Disbursed,
                "disbursed to borrower",
            )
            .await?;

        self.loans.get(id).await
    }

    /// Pure read-side check against the static transition table.
    pub async fn can_advance(
        &self,
        id: i64,
        target: LoanPhase,
    ) -> Result<bool, LoanFlowError> {
        let loan = self.loans.get(id).await?;
        Ok(loan.phase.can_advance_to(target))
    }

    pub async fn history(&self, id: i64) -> Result<Vec<PhaseTransition>, LoanFlowError> {
        self.loans.get(id).await?;
        self.transitions.list_for(id).await
    }

    pub async fn contributions(&self, id: i64) -> Result<Vec<Contribution>, LoanFlowError> {
        self.loans.get(id).await?;
        self.contributions.list_for(id).await
    }

    pub async fn approval(&self, id: i64) -> Result<Option<ApprovalEvidence>, LoanFlowError> {
        self.loans.get(id).await?;
        self.loans.get_approval(id).await
    }

    pub async fn disbursement(
        &self,
        id: i64,
    ) -> Result<Option<DisbursementEvidence>, LoanFlowError> {
        self.loans.get(id).await?;
        self.loans.get_disbursement(id).await
    }

    /// Recompute the ledger sum and compare it with the stored total.
    pub async fn verify_totals(&self, id: i64) -> Result<TotalsReport, LoanFlowError> {
        let loan = self.loans.get(id).await?;
        let ledger_minor = self.contributions.sum_for(id).await?;
        let consistent = ledger_minor == loan.total_contributed_minor;
        if !consistent {
            warn!(
                loan_ref = %loan.loan_ref,
                stored = loan.total_contributed_minor,
                ledger = ledger_minor,
                "ledger drift detected"
            );
        }
        Ok(TotalsReport {
            loan_id: id,
            stored_minor: loan.total_contributed_minor,
            ledger_minor,
            consistent,
        })
    }
}
