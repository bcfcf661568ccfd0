use serde::{Deserialize, Serialize};
use std::fmt;

/// Loan lifecycle phases, strictly forward-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanPhase {
    Proposed,
    Approved,
    Funded,
    Disbursed,
}

impl LoanPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Funded => "funded",
            Self::Disbursed => "disbursed",
        }
    }

    /// Storage round-trip counterpart of [`LoanPhase::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proposed" => Some(Self::Proposed),
            "approved" => Some(Self::Approved),
            "funded" => Some(Self::Funded),
            "disbursed" => Some(Self::Disbursed),
            _ => None,
        }
    }

    /// Legal next phases.
    ///
    /// This table is the single source of truth for transition policy; both
    /// `can_advance` queries and the mutating engine paths consult it.
    pub fn next_phases(self) -> &'static [LoanPhase] {
        match self {
            Self::Proposed => &[Self::Approved],
            Self::Approved => &[Self::Funded],
            Self::Funded => &[Self::Disbursed],
            Self::Disbursed => &[],
        }
    }

    pub fn can_advance_to(self, target: LoanPhase) -> bool {
        self.next_phases().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.next_phases().is_empty()
    }
}

impl fmt::Display for LoanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
