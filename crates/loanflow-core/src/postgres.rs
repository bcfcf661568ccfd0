//! PostgreSQL-backed store implementations.
//!
//! The schema is bootstrapped by the application; the UNIQUE constraint on
//! (loan_id, contributor_id) backs the duplicate-contributor guarantee as a
//! second line of defense behind the engine's per-loan exclusive section.

use crate::error::LoanFlowError;
use crate::history::{self, PhaseTransition};
use crate::phase::LoanPhase;
use crate::store::{ContributionLedger, LoanStore, RecordOutcome, TransitionLog};
use crate::types::{ApprovalEvidence, Contribution, DisbursementEvidence, Loan, NewLoan};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, LoanFlowError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .map_err(|e| LoanFlowError::Storage(format!("postgres connect failed: {e}")))
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), LoanFlowError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS loans (
            id BIGSERIAL PRIMARY KEY,
            loan_ref UUID NOT NULL UNIQUE,
            borrower_id BIGINT NOT NULL,
            principal_minor BIGINT NOT NULL,
            rate DOUBLE PRECISION NOT NULL,
            roi DOUBLE PRECISION NOT NULL,
            agreement_letter_link TEXT NOT NULL,
            phase TEXT NOT NULL,
            total_contributed_minor BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS loan_contributions (
            id BIGSERIAL PRIMARY KEY,
            loan_id BIGINT NOT NULL REFERENCES loans(id),
            contributor_id TEXT NOT NULL,
            amount_minor BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (loan_id, contributor_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS loan_phase_transitions (
            entry_id UUID PRIMARY KEY,
            loan_id BIGINT NOT NULL REFERENCES loans(id),
            entry_index BIGINT NOT NULL,
            previous_phase TEXT NOT NULL,
            new_phase TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            previous_hash TEXT NULL,
            entry_hash TEXT NOT NULL,
            UNIQUE (loan_id, entry_index)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS loan_approvals (
            loan_id BIGINT PRIMARY KEY REFERENCES loans(id),
            validator_employee_id TEXT NOT NULL,
            proof_image_url TEXT NOT NULL,
            approved_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS loan_disbursements (
            loan_id BIGINT PRIMARY KEY REFERENCES loans(id),
            officer_employee_id TEXT NOT NULL,
            signed_agreement_url TEXT NOT NULL,
            disbursed_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_loans_phase ON loans (phase)",
        "CREATE INDEX IF NOT EXISTS idx_loan_contributions_loan_id ON loan_contributions (loan_id)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| LoanFlowError::Storage(format!("postgres schema create failed: {e}")))?;
    }

    Ok(())
}

fn storage_err(context: &str, err: sqlx::Error) -> LoanFlowError {
    LoanFlowError::Storage(format!("{context}: {err}"))
}

/// True when the error is a foreign-key violation, i.e. the referenced loan
/// row does not exist.
fn is_missing_loan(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23503")
        .unwrap_or(false)
}

fn loan_from_row(row: &PgRow) -> Result<Loan, LoanFlowError> {
    let phase_str: String = row
        .try_get("phase")
        .map_err(|e| storage_err("decode phase", e))?;
    let phase = LoanPhase::parse(&phase_str)
        .ok_or_else(|| LoanFlowError::Storage(format!("unknown phase '{phase_str}' in storage")))?;

    Ok(Loan {
        id: row.try_get("id").map_err(|e| storage_err("decode id", e))?,
        loan_ref: row
            .try_get("loan_ref")
            .map_err(|e| storage_err("decode loan_ref", e))?,
        borrower_id: row
            .try_get("borrower_id")
            .map_err(|e| storage_err("decode borrower_id", e))?,
        principal_minor: row
            .try_get("principal_minor")
            .map_err(|e| storage_err("decode principal_minor", e))?,
        rate: row
            .try_get("rate")
            .map_err(|e| storage_err("decode rate", e))?,
        roi: row
            .try_get("roi")
            .map_err(|e| storage_err("decode roi", e))?,
        agreement_letter_link: row
            .try_get("agreement_letter_link")
            .map_err(|e| storage_err("decode agreement_letter_link", e))?,
        phase,
        total_contributed_minor: row
            .try_get("total_contributed_minor")
            .map_err(|e| storage_err("decode total_contributed_minor", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| storage_err("decode created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| storage_err("decode updated_at", e))?,
    })
}

const LOAN_COLUMNS: &str = "id, loan_ref, borrower_id, principal_minor, rate, roi, \
     agreement_letter_link, phase, total_contributed_minor, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgLoanStore {
    pool: PgPool,
}

impl PgLoanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoanStore for PgLoanStore {
    async fn create(&self, new_loan: NewLoan) -> Result<Loan, LoanFlowError> {
        let loan_ref = Uuid::new_v4();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO loans (
                loan_ref, borrower_id, principal_minor, rate, roi,
                agreement_letter_link, phase, total_contributed_minor
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
            RETURNING {LOAN_COLUMNS}
            "#
        ))
        .bind(loan_ref)
        .bind(new_loan.borrower_id)
        .bind(new_loan.principal_minor)
        .bind(new_loan.rate)
        .bind(new_loan.roi)
        .bind(&new_loan.agreement_letter_link)
        .bind(LoanPhase::Proposed.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_err("postgres loan insert failed", e))?;

        loan_from_row(&row)
    }

    async fn get(&self, id: i64) -> Result<Loan, LoanFlowError> {
        let row = sqlx::query(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("postgres loan select failed", e))?
            .ok_or(LoanFlowError::NotFound)?;
        loan_from_row(&row)
    }

    async fn get_by_ref(&self, loan_ref: Uuid) -> Result<Loan, LoanFlowError> {
        let row = sqlx::query(&format!(
            "SELECT {LOAN_COLUMNS} FROM loans WHERE loan_ref = $1"
        ))
        .bind(loan_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("postgres loan select failed", e))?
        .ok_or(LoanFlowError::NotFound)?;
        loan_from_row(&row)
    }

    async fn list(
        &self,
        phase: Option<LoanPhase>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Loan>, LoanFlowError> {
        let rows = match phase {
            Some(phase) => {
                sqlx::query(&format!(
                    "SELECT {LOAN_COLUMNS} FROM loans WHERE phase = $1 \
                     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
                ))
                .bind(phase.as_str())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {LOAN_COLUMNS} FROM loans \
                     ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
                ))
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| storage_err("postgres loan list failed", e))?;

        rows.iter().map(loan_from_row).collect()
    }

    async fn delete(&self, id: i64) -> Result<(), LoanFlowError> {
        let result = sqlx::query("DELETE FROM loans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("postgres loan delete failed", e))?;
        if result.rows_affected() == 0 {
            return Err(LoanFlowError::NotFound);
        }
        Ok(())
    }

    async fn compare_and_set_phase(
        &self,
        id: i64,
        expected: LoanPhase,
        new: LoanPhase,
    ) -> Result<(), LoanFlowError> {
        let result = sqlx::query(
            "UPDATE loans SET phase = $3, updated_at = NOW() WHERE id = $1 AND phase = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("postgres phase update failed", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("postgres loan select failed", e))?
            .is_some();

        if exists {
            Err(LoanFlowError::Conflict)
        } else {
            Err(LoanFlowError::NotFound)
        }
    }

    async fn add_to_total(&self, id: i64, delta_minor: i64) -> Result<i64, LoanFlowError> {
        let row = sqlx::query(
            "UPDATE loans \
             SET total_contributed_minor = total_contributed_minor + $2, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING total_contributed_minor",
        )
        .bind(id)
        .bind(delta_minor)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("postgres total update failed", e))?
        .ok_or(LoanFlowError::NotFound)?;

        row.try_get("total_contributed_minor")
            .map_err(|e| storage_err("decode total_contributed_minor", e))
    }

    async fn put_approval(
        &self,
        loan_id: i64,
        evidence: &ApprovalEvidence,
    ) -> Result<(), LoanFlowError> {
        sqlx::query(
            r#"
            INSERT INTO loan_approvals (loan_id, validator_employee_id, proof_image_url, approved_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (loan_id) DO UPDATE SET
                validator_employee_id = EXCLUDED.validator_employee_id,
                proof_image_url = EXCLUDED.proof_image_url,
                approved_at = EXCLUDED.approved_at
            "#,
        )
        .bind(loan_id)
        .bind(&evidence.validator_employee_id)
        .bind(&evidence.proof_image_url)
        .bind(evidence.approved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_missing_loan(&e) {
                LoanFlowError::NotFound
            } else {
                storage_err("postgres approval insert failed", e)
            }
        })?;
        Ok(())
    }

    async fn get_approval(
        &self,
        loan_id: i64,
    ) -> Result<Option<ApprovalEvidence>, LoanFlowError> {
        let row = sqlx::query(
            "SELECT validator_employee_id, proof_image_url, approved_at \
             FROM loan_approvals WHERE loan_id = $1",
        )
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("postgres approval select failed", e))?;

        row.map(|row| {
            Ok(ApprovalEvidence {
                validator_employee_id: row
                    .try_get("validator_employee_id")
                    .map_err(|e| storage_err("decode validator_employee_id", e))?,
                proof_image_url: row
                    .try_get("proof_image_url")
                    .map_err(|e| storage_err("decode proof_image_url", e))?,
                approved_at: row
                    .try_get("approved_at")
                    .map_err(|e| storage_err("decode approved_at", e))?,
            })
        })
        .transpose()
    }

    async fn put_disbursement(
        &self,
        loan_id: i64,
        evidence: &DisbursementEvidence,
    ) -> Result<(), LoanFlowError> {
        sqlx::query(
            r#"
            INSERT INTO loan_disbursements (loan_id, officer_employee_id, signed_agreement_url, disbursed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (loan_id) DO UPDATE SET
                officer_employee_id = EXCLUDED.officer_employee_id,
                signed_agreement_url = EXCLUDED.signed_agreement_url,
                disbursed_at = EXCLUDED.disbursed_at
            "#,
        )
        .bind(loan_id)
        .bind(&evidence.officer_employee_id)
        .bind(&evidence.signed_agreement_url)
        .bind(evidence.disbursed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_missing_loan(&e) {
                LoanFlowError::NotFound
            } else {
                storage_err("postgres disbursement insert failed", e)
            }
        })?;
        Ok(())
    }

    async fn get_disbursement(
        &self,
        loan_id: i64,
    ) -> Result<Option<DisbursementEvidence>, LoanFlowError> {
        let row = sqlx::query(
            "SELECT officer_employee_id, signed_agreement_url, disbursed_at \
             FROM loan_disbursements WHERE loan_id = $1",
        )
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("postgres disbursement select failed", e))?;

        row.map(|row| {
            Ok(DisbursementEvidence {
                officer_employee_id: row
                    .try_get("officer_employee_id")
                    .map_err(|e| storage_err("decode officer_employee_id", e))?,
                signed_agreement_url: row
                    .try_get("signed_agreement_url")
                    .map_err(|e| storage_err("decode signed_agreement_url", e))?,
                disbursed_at: row
                    .try_get("disbursed_at")
                    .map_err(|e| storage_err("decode disbursed_at", e))?,
            })
        })
        .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PgContributionLedger {
    pool: PgPool,
}

impl PgContributionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn contribution_from_row(row: &PgRow) -> Result<Contribution, LoanFlowError> {
    Ok(Contribution {
        id: row.try_get("id").map_err(|e| storage_err("decode id", e))?,
        loan_id: row
            .try_get("loan_id")
            .map_err(|e| storage_err("decode loan_id", e))?,
        contributor_id: row
            .try_get("contributor_id")
            .map_err(|e| storage_err("decode contributor_id", e))?,
        amount_minor: row
            .try_get("amount_minor")
            .map_err(|e| storage_err("decode amount_minor", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| storage_err("decode created_at", e))?,
    })
}

#[async_trait]
impl ContributionLedger for PgContributionLedger {
    async fn try_record(
        &self,
        loan_id: i64,
        contributor_id: &str,
        amount_minor: i64,
    ) -> Result<RecordOutcome, LoanFlowError> {
        // ON CONFLICT DO NOTHING makes the uniqueness check atomic with the
        // insertion; a losing racer observes no returned row.
        let row = sqlx::query(
            r#"
            INSERT INTO loan_contributions (loan_id, contributor_id, amount_minor)
            VALUES ($1, $2, $3)
            ON CONFLICT (loan_id, contributor_id) DO NOTHING
            RETURNING id, loan_id, contributor_id, amount_minor, created_at
            "#,
        )
        .bind(loan_id)
        .bind(contributor_id)
        .bind(amount_minor)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_missing_loan(&e) {
                LoanFlowError::NotFound
            } else {
                storage_err("postgres contribution insert failed", e)
            }
        })?;

        match row {
            Some(row) => Ok(RecordOutcome::Accepted(contribution_from_row(&row)?)),
            None => Ok(RecordOutcome::DuplicateContributor),
        }
    }

    async fn sum_for(&self, loan_id: i64) -> Result<i64, LoanFlowError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount_minor), 0)::BIGINT AS total \
             FROM loan_contributions WHERE loan_id = $1",
        )
        .bind(loan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_err("postgres contribution sum failed", e))?;

        row.try_get("total")
            .map_err(|e| storage_err("decode total", e))
    }

    async fn list_for(&self, loan_id: i64) -> Result<Vec<Contribution>, LoanFlowError> {
        let rows = sqlx::query(
            "SELECT id, loan_id, contributor_id, amount_minor, created_at \
             FROM loan_contributions WHERE loan_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("postgres contribution list failed", e))?;

        rows.iter().map(contribution_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgTransitionLog {
    pool: PgPool,
}

impl PgTransitionLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn transition_from_row(row: &PgRow) -> Result<PhaseTransition, LoanFlowError> {
    let previous_str: String = row
        .try_get("previous_phase")
        .map_err(|e| storage_err("decode previous_phase", e))?;
    let new_str: String = row
        .try_get("new_phase")
        .map_err(|e| storage_err("decode new_phase", e))?;
    let previous_phase = LoanPhase::parse(&previous_str).ok_or_else(|| {
        LoanFlowError::Storage(format!("unknown phase '{previous_str}' in storage"))
    })?;
    let new_phase = LoanPhase::parse(&new_str)
        .ok_or_else(|| LoanFlowError::Storage(format!("unknown phase '{new_str}' in storage")))?;
    let index: i64 = row
        .try_get("entry_index")
        .map_err(|e| storage_err("decode entry_index", e))?;

    Ok(PhaseTransition {
        entry_id: row
            .try_get("entry_id")
            .map_err(|e| storage_err("decode entry_id", e))?,
        loan_id: row
            .try_get("loan_id")
            .map_err(|e| storage_err("decode loan_id", e))?,
        index: index
            .try_into()
            .map_err(|_| LoanFlowError::Storage("negative transition index in storage".to_string()))?,
        previous_phase,
        new_phase,
        reason: row
            .try_get("reason")
            .map_err(|e| storage_err("decode reason", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| storage_err("decode created_at", e))?,
        previous_hash: row
            .try_get("previous_hash")
            .map_err(|e| storage_err("decode previous_hash", e))?,
        entry_hash: row
            .try_get("entry_hash")
            .map_err(|e| storage_err("decode entry_hash", e))?,
    })
}

#[async_trait]
impl TransitionLog for PgTransitionLog {
    async fn append(
        &self,
        loan_id: i64,
        previous_phase: LoanPhase,
        new_phase: LoanPhase,
        reason: &str,
    ) -> Result<PhaseTransition, LoanFlowError> {
        let last = sqlx::query(
            "SELECT entry_index, entry_hash FROM loan_phase_transitions \
             WHERE loan_id = $1 ORDER BY entry_index DESC LIMIT 1",
        )
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_err("postgres transition select failed", e))?;

        let (index, previous_hash) = match last {
            Some(row) => {
                let last_index: i64 = row
                    .try_get("entry_index")
                    .map_err(|e| storage_err("decode entry_index", e))?;
                let last_hash: String = row
                    .try_get("entry_hash")
                    .map_err(|e| storage_err("decode entry_hash", e))?;
                (last_index as u64 + 1, Some(last_hash))
            }
            None => (0, None),
        };

        let entry = PhaseTransition::build(
            loan_id,
            index,
            previous_phase,
            new_phase,
            reason,
            previous_hash,
        )?;

        let index_db: i64 = entry.index.try_into().map_err(|_| {
            LoanFlowError::Storage("transition index exceeds postgres BIGINT range".to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO loan_phase_transitions (
                entry_id, loan_id, entry_index, previous_phase, new_phase,
                reason, created_at, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.loan_id)
        .bind(index_db)
        .bind(entry.previous_phase.as_str())
        .bind(entry.new_phase.as_str())
        .bind(&entry.reason)
        .bind(entry.created_at)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_missing_loan(&e) {
                LoanFlowError::NotFound
            } else {
                storage_err("postgres transition insert failed", e)
            }
        })?;

        Ok(entry)
    }

    async fn list_for(&self, loan_id: i64) -> Result<Vec<PhaseTransition>, LoanFlowError> {
        let rows = sqlx::query(
            "SELECT entry_id, loan_id, entry_index, previous_phase, new_phase, \
                    reason, created_at, previous_hash, entry_hash \
             FROM loan_phase_transitions WHERE loan_id = $1 ORDER BY entry_index ASC",
        )
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_err("postgres transition list failed", e))?;

        let entries = rows
            .iter()
            .map(transition_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !history::verify_chain(&entries) {
            return Err(LoanFlowError::History(format!(
                "persisted chain verification failed for loan {loan_id}"
            )));
        }

        Ok(entries)
    }
}
