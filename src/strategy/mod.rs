//! Entry strategy: cycle-level risk gating and per-candidate sizing.

pub mod risk;
pub mod sizer;

pub use risk::{GateInputs, GateRejection, RiskGate, Verdict};
pub use sizer::{PositionSizer, SizedEntry, SizerConfig};

use crate::types::{Candidate, ConfidenceGrade};

/// Whether a candidate's grade allows an entry at all.
///
/// A–C are the only entry grades; `minimum` can only narrow that further.
pub fn grade_eligible(candidate: &Candidate, minimum: ConfidenceGrade) -> bool {
    candidate.grade.is_entry_grade() && candidate.grade.meets(minimum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_grade_eligibility() {
        let c = |g| Candidate::new("X", g, dec!(10));
        assert!(grade_eligible(&c(ConfidenceGrade::A), ConfidenceGrade::C));
        assert!(grade_eligible(&c(ConfidenceGrade::C), ConfidenceGrade::C));
        assert!(!grade_eligible(&c(ConfidenceGrade::D), ConfidenceGrade::C));
        assert!(!grade_eligible(&c(ConfidenceGrade::C), ConfidenceGrade::B));
        // a looser minimum never admits D/F
        assert!(!grade_eligible(&c(ConfidenceGrade::F), ConfidenceGrade::F));
    }
}
