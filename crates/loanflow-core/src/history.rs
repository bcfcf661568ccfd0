use crate::error::LoanFlowError;
use crate::phase::LoanPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable audit record for one phase change.
///
/// Records are hash-chained per loan: each entry commits to its predecessor,
/// so the ordered sequence reconstructs the loan's history and tampering is
/// detectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub entry_id: Uuid,
    pub loan_id: i64,
    /// Position in the loan's chain, starting at zero.
    pub index: u64,
    pub previous_phase: LoanPhase,
    pub new_phase: LoanPhase,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl PhaseTransition {
    /// Build the successor record for a loan's chain.
    ///
    /// Rejects edges the transition table does not allow, so an illegal
    /// record can never be constructed, let alone persisted.
    pub(crate) fn build(
        loan_id: i64,
        index: u64,
        previous_phase: LoanPhase,
        new_phase: LoanPhase,
        reason: &str,
        previous_hash: Option<String>,
    ) -> Result<Self, LoanFlowError> {
        if !previous_phase.can_advance_to(new_phase) {
            return Err(LoanFlowError::History(format!(
                "illegal transition '{previous_phase}' -> '{new_phase}'"
            )));
        }

        let created_at = Utc::now();
        let entry_hash = compute_entry_hash(
            loan_id,
            index,
            previous_phase,
            new_phase,
            reason,
            created_at,
            previous_hash.as_deref(),
        );

        Ok(Self {
            entry_id: Uuid::new_v4(),
            loan_id,
            index,
            previous_phase,
            new_phase,
            reason: reason.to_string(),
            created_at,
            previous_hash,
            entry_hash,
        })
    }

    /// Recompute this entry's hash and check the predecessor link.
    pub fn verify_against(&self, previous_hash: Option<&str>) -> bool {
        let expected = compute_entry_hash(
            self.loan_id,
            self.index,
            self.previous_phase,
            self.new_phase,
            &self.reason,
            self.created_at,
            previous_hash,
        );
        self.entry_hash == expected && self.previous_hash.as_deref() == previous_hash
    }
}

/// Verify an ordered per-loan sequence: index continuity from zero, hash
/// linkage, and forward-only edges.
pub fn verify_chain(entries: &[PhaseTransition]) -> bool {
    let mut previous_hash: Option<&str> = None;
    for (expected_index, entry) in entries.iter().enumerate() {
        if entry.index != expected_index as u64 {
            return false;
        }
        if !entry.previous_phase.can_advance_to(entry.new_phase) {
            return false;
        }
        if !entry.verify_against(previous_hash) {
            return false;
        }
        previous_hash = Some(entry.entry_hash.as_str());
    }
    true
}

/// Append-only transition chain for a single loan.
///
/// No in-place mutation APIs are exposed; every phase change becomes an
/// additional record.
#[derive(Debug, Clone)]
pub struct TransitionChain {
    loan_id: i64,
    entries: Vec<PhaseTransition>,
}

impl TransitionChain {
    pub fn new(loan_id: i64) -> Self {
        Self {
            loan_id,
            entries: Vec::new(),
        }
    }

    /// Rebuild a chain from persisted records and verify its integrity.
    pub fn from_records(
        loan_id: i64,
        entries: Vec<PhaseTransition>,
    ) -> Result<Self, LoanFlowError> {
        if entries.iter().any(|entry| entry.loan_id != loan_id) {
            return Err(LoanFlowError::History(format!(
                "foreign record in chain for loan {loan_id}"
            )));
        }
        if !verify_chain(&entries) {
            return Err(LoanFlowError::History(format!(
                "persisted chain verification failed for loan {loan_id}"
            )));
        }
        Ok(Self { loan_id, entries })
    }

    pub fn loan_id(&self) -> i64 {
        self.loan_id
    }

    pub fn entries(&self) -> &[PhaseTransition] {
        &self.entries
    }

    pub fn last(&self) -> Option<&PhaseTransition> {
        self.entries.last()
    }

    pub fn append(
        &mut self,
        previous_phase: LoanPhase,
        new_phase: LoanPhase,
        reason: &str,
    ) -> Result<PhaseTransition, LoanFlowError> {
        let entry = PhaseTransition::build(
            self.loan_id,
            self.entries.len() as u64,
            previous_phase,
            new_phase,
            reason,
            self.entries.last().map(|entry| entry.entry_hash.clone()),
        )?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn verify(&self) -> bool {
        verify_chain(&self.entries)
    }
}

fn compute_entry_hash(
    loan_id: i64,
    index: u64,
    previous_phase: LoanPhase,
    new_phase: LoanPhase,
    reason: &str,
    created_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "loan_id": loan_id,
        "index": index,
        "previous_phase": previous_phase,
        "new_phase": new_phase,
        "reason": reason,
        "created_at": created_at,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
