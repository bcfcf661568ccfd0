//! Loan funding ledger and state-transition engine.
//!
//! This crate enforces the loan lifecycle invariants with explicit phase
//! gating: forward-only transitions through
//! `proposed -> approved -> funded -> disbursed`, a contribution total that
//! can never exceed the principal even under concurrent contribution
//! attempts, and an append-only hash-chained audit trail of every phase
//! change.

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod history;
pub mod memory;
pub mod notify;
pub mod phase;
pub mod postgres;
pub mod store;
pub mod types;

pub use engine::{EngineConfig, TotalsReport, TransitionEngine};
pub use error::LoanFlowError;
pub use history::{verify_chain, PhaseTransition, TransitionChain};
pub use memory::{MemoryContributionLedger, MemoryLoanStore, MemoryTransitionLog};
pub use notify::{FundedNotifier, NoopNotifier};
pub use phase::LoanPhase;
pub use postgres::{PgContributionLedger, PgLoanStore, PgTransitionLog};
pub use store::{
    ContributionLedger, LoanStore, RecordOutcome, StorageConfig, TransitionLog,
};
pub use types::{
    ApprovalEvidence, Contribution, ContributionReceipt, DisbursementEvidence,
    FundedNotification, Loan, NewLoan,
};
