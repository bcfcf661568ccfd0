//! In-memory store implementations backing the default configuration and
//! the test suite.

use crate::error::LoanFlowError;
use crate::history::{PhaseTransition, TransitionChain};
use crate::phase::LoanPhase;
use crate::store::{ContributionLedger, LoanStore, RecordOutcome, TransitionLog};
use crate::types::{ApprovalEvidence, Contribution, DisbursementEvidence, Loan, NewLoan};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LoanRows {
    next_id: i64,
    loans: HashMap<i64, Loan>,
    by_ref: HashMap<Uuid, i64>,
    approvals: HashMap<i64, ApprovalEvidence>,
    disbursements: HashMap<i64, DisbursementEvidence>,
}

#[derive(Default)]
pub struct MemoryLoanStore {
    rows: RwLock<LoanRows>,
}

impl MemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoanStore for MemoryLoanStore {
    async fn create(&self, new_loan: NewLoan) -> Result<Loan, LoanFlowError> {
        let mut rows = self.rows.write().await;
        rows.next_id += 1;
        let now = Utc::now();
        let loan = Loan {
            id: rows.next_id,
            loan_ref: Uuid::new_v4(),
            borrower_id: new_loan.borrower_id,
            principal_minor: new_loan.principal_minor,
            rate: new_loan.rate,
            roi: new_loan.roi,
            agreement_letter_link: new_loan.agreement_letter_link,
            phase: LoanPhase::Proposed,
            total_contributed_minor: 0,
            created_at: now,
            updated_at: now,
        };
        rows.by_ref.insert(loan.loan_ref, loan.id);
        rows.loans.insert(loan.id, loan.clone());
        Ok(loan)
    }

    async fn get(&self, id: i64) -> Result<Loan, LoanFlowError> {
        self.rows
            .read()
            .await
            .loans
            .get(&id)
            .cloned()
            .ok_or(LoanFlowError::NotFound)
    }

    async fn get_by_ref(&self, loan_ref: Uuid) -> Result<Loan, LoanFlowError> {
        let rows = self.rows.read().await;
        rows.by_ref
            .get(&loan_ref)
            .and_then(|id| rows.loans.get(id))
            .cloned()
            .ok_or(LoanFlowError::NotFound)
    }

    async fn list(
        &self,
        phase: Option<LoanPhase>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Loan>, LoanFlowError> {
        let rows = self.rows.read().await;
        let mut loans: Vec<Loan> = rows
            .loans
            .values()
            .filter(|loan| phase.map(|p| loan.phase == p).unwrap_or(true))
            .cloned()
            .collect();
        loans.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(loans
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn delete(&self, id: i64) -> Result<(), LoanFlowError> {
        let mut rows = self.rows.write().await;
        let loan = rows.loans.remove(&id).ok_or(LoanFlowError::NotFound)?;
        rows.by_ref.remove(&loan.loan_ref);
        rows.approvals.remove(&id);
        rows.disbursements.remove(&id);
        Ok(())
    }

    async fn compare_and_set_phase(
        &self,
        id: i64,
        expected: LoanPhase,
        new: LoanPhase,
    ) -> Result<(), LoanFlowError> {
        let mut rows = self.rows.write().await;
        let loan = rows.loans.get_mut(&id).ok_or(LoanFlowError::NotFound)?;
        if loan.phase != expected {
            return Err(LoanFlowError::Conflict);
        }
        loan.phase = new;
        loan.updated_at = Utc::now();
        Ok(())
    }

    async fn add_to_total(&self, id: i64, delta_minor: i64) -> Result<i64, LoanFlowError> {
        let mut rows = self.rows.write().await;
        let loan = rows.loans.get_mut(&id).ok_or(LoanFlowError::NotFound)?;
        loan.total_contributed_minor += delta_minor;
        loan.updated_at = Utc::now();
        Ok(loan.total_contributed_minor)
    }

    async fn put_approval(
        &self,
        loan_id: i64,
        evidence: &ApprovalEvidence,
    ) -> Result<(), LoanFlowError> {
        let mut rows = self.rows.write().await;
        if !rows.loans.contains_key(&loan_id) {
            return Err(LoanFlowError::NotFound);
        }
        rows.approvals.insert(loan_id, evidence.clone());
        Ok(())
    }

    async fn get_approval(
        &self,
        loan_id: i64,
    ) -> Result<Option<ApprovalEvidence>, LoanFlowError> {
        Ok(self.rows.read().await.approvals.get(&loan_id).cloned())
    }

    async fn put_disbursement(
        &self,
        loan_id: i64,
        evidence: &DisbursementEvidence,
    ) -> Result<(), LoanFlowError> {
        let mut rows = self.rows.write().await;
        if !rows.loans.contains_key(&loan_id) {
            return Err(LoanFlowError::NotFound);
        }
        rows.disbursements.insert(loan_id, evidence.clone());
        Ok(())
    }

    async fn get_disbursement(
        &self,
        loan_id: i64,
    ) -> Result<Option<DisbursementEvidence>, LoanFlowError> {
        Ok(self.rows.read().await.disbursements.get(&loan_id).cloned())
    }
}

#[derive(Default)]
struct ContributionRows {
    next_id: i64,
    rows: Vec<Contribution>,
    seen: HashSet<(i64, String)>,
}

#[derive(Default)]
pub struct MemoryContributionLedger {
    rows: RwLock<ContributionRows>,
}

impl MemoryContributionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContributionLedger for MemoryContributionLedger {
    async fn try_record(
        &self,
        loan_id: i64,
        contributor_id: &str,
        amount_minor: i64,
    ) -> Result<RecordOutcome, LoanFlowError> {
        let mut rows = self.rows.write().await;
        let key = (loan_id, contributor_id.to_string());
        if rows.seen.contains(&key) {
            return Ok(RecordOutcome::DuplicateContributor);
        }
        rows.next_id += 1;
        let contribution = Contribution {
            id: rows.next_id,
            loan_id,
            contributor_id: contributor_id.to_string(),
            amount_minor,
            created_at: Utc::now(),
        };
        rows.seen.insert(key);
        rows.rows.push(contribution.clone());
        Ok(RecordOutcome::Accepted(contribution))
    }

    async fn sum_for(&self, loan_id: i64) -> Result<i64, LoanFlowError> {
        Ok(self
            .rows
            .read()
            .await
            .rows
            .iter()
            .filter(|row| row.loan_id == loan_id)
            .map(|row| row.amount_minor)
            .sum())
    }

    async fn list_for(&self, loan_id: i64) -> Result<Vec<Contribution>, LoanFlowError> {
        Ok(self
            .rows
            .read()
            .await
            .rows
            .iter()
            .filter(|row| row.loan_id == loan_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryTransitionLog {
    chains: RwLock<HashMap<i64, TransitionChain>>,
}

impl MemoryTransitionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransitionLog for MemoryTransitionLog {
    async fn append(
        &self,
        loan_id: i64,
        previous_phase: LoanPhase,
        new_phase: LoanPhase,
        reason: &str,
    ) -> Result<PhaseTransition, LoanFlowError> {
        let mut chains = self.chains.write().await;
        chains
            .entry(loan_id)
            .or_insert_with(|| TransitionChain::new(loan_id))
            .append(previous_phase, new_phase, reason)
    }

    async fn list_for(&self, loan_id: i64) -> Result<Vec<PhaseTransition>, LoanFlowError> {
        let chains = self.chains.read().await;
        match chains.get(&loan_id) {
            None => Ok(Vec::new()),
            Some(chain) => {
                if !chain.verify() {
                    return Err(LoanFlowError::History(format!(
                        "chain verification failed for loan {loan_id}"
                    )));
                }
                Ok(chain.entries().to_vec())
            }
        }
    }
}
