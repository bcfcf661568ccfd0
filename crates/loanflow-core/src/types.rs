use crate::phase::LoanPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A funding instrument tracked through its lifecycle.
///
/// `total_contributed_minor` is derived state: it is always the sum of the
/// accepted contribution rows for this loan and is written only by the
/// transition engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    /// Internal storage key.
    pub id: i64,
    /// Stable externally visible reference.
    pub loan_ref: Uuid,
    pub borrower_id: i64,
    /// Target amount in minor units, fixed at creation.
    pub principal_minor: i64,
    /// Flat interest percentage, 0..=100. Carried for downstream consumers;
    /// never computed with here.
    pub rate: f64,
    /// Return-of-investment percentage, 0..=100.
    pub roi: f64,
    /// Reference link handed to contributors when the loan becomes funded.
    pub agreement_letter_link: String,
    pub phase: LoanPhase,
    pub total_contributed_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    pub fn remaining_capacity_minor(&self) -> i64 {
        self.principal_minor - self.total_contributed_minor
    }
}

/// Creation payload. Validated by the engine before it reaches a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoan {
    pub borrower_id: i64,
    pub principal_minor: i64,
    pub rate: f64,
    pub roi: f64,
    pub agreement_letter_link: String,
}

/// An accepted contribution row. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: i64,
    pub loan_id: i64,
    pub contributor_id: String,
    pub amount_minor: i64,
    pub created_at: DateTime<Utc>,
}

/// Approval evidence: who validated the loan in the field, and the proof.
///
/// Treated as opaque structured data; only non-emptiness is enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvidence {
    pub validator_employee_id: String,
    pub proof_image_url: String,
    pub approved_at: DateTime<Utc>,
}

impl ApprovalEvidence {
    pub fn new(
        validator_employee_id: impl Into<String>,
        proof_image_url: impl Into<String>,
    ) -> Self {
        Self {
            validator_employee_id: validator_employee_id.into(),
            proof_image_url: proof_image_url.into(),
            approved_at: Utc::now(),
        }
    }
}

/// Disbursement evidence: the field officer and the signed agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisbursementEvidence {
    pub officer_employee_id: String,
    pub signed_agreement_url: String,
    pub disbursed_at: DateTime<Utc>,
}

impl DisbursementEvidence {
    pub fn new(
        officer_employee_id: impl Into<String>,
        signed_agreement_url: impl Into<String>,
    ) -> Self {
        Self {
            officer_employee_id: officer_employee_id.into(),
            signed_agreement_url: signed_agreement_url.into(),
            disbursed_at: Utc::now(),
        }
    }
}

/// One logical notification event per contributor, emitted exactly once per
/// loan on the funding transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundedNotification {
    pub contributor_id: String,
    pub loan_ref: Uuid,
    pub reference_link: String,
}

/// Result of an accepted contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionReceipt {
    pub contribution: Contribution,
    /// Loan state after the contribution was applied.
    pub loan: Loan,
    /// True when this call triggered the `approved -> funded` transition.
    pub funded: bool,
}
