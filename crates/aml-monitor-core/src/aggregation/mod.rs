//! Case records and the escalation policy applied to them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::detection::policy::RiskLevel;
use crate::detection::{Annotation, PatternKind, PatternMatch};
use crate::types::Score;

pub mod aggregator;

pub use aggregator::{AggregationDelta, AlertAggregator};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Open,
    Escalated,
    ClosedBenign,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Open => "open",
            Disposition::Escalated => "escalated",
            Disposition::ClosedBenign => "closed_benign",
        }
    }

    /// Escalation is sticky; otherwise the disposition follows the evidence.
    pub(crate) fn next(previous: Option<Disposition>, all_legitimate: bool, escalate: bool) -> Self {
        match previous {
            Some(Disposition::Escalated) => Disposition::Escalated,
            _ if all_legitimate => Disposition::ClosedBenign,
            _ if escalate => Disposition::Escalated,
            _ => Disposition::Open,
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation policy
// ---------------------------------------------------------------------------

/// Maps a case's combined score (and its matches) to an escalation decision.
pub trait EscalationPolicy: Send + Sync {
    fn should_escalate(&self, score: Score, matches: &[&PatternMatch]) -> bool;
}

/// Escalate when the combined score reaches a fixed threshold.
#[derive(Debug, Clone)]
pub struct ThresholdEscalation {
    pub threshold: Score,
}

impl EscalationPolicy for ThresholdEscalation {
    fn should_escalate(&self, score: Score, _matches: &[&PatternMatch]) -> bool {
        score >= self.threshold
    }
}

// ---------------------------------------------------------------------------
// Case
// ---------------------------------------------------------------------------

/// One contributing match as it appears in a case's evidence trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEvidence {
    pub match_id: String,
    /// Reported kind (`false_positive_suppressed` once demoted)
    pub kind: PatternKind,
    pub detector: PatternKind,
    pub confidence: Score,
    pub transaction_ids: Vec<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub annotations: BTreeSet<Annotation>,
}

impl From<&PatternMatch> for CaseEvidence {
    fn from(m: &PatternMatch) -> Self {
        CaseEvidence {
            match_id: m.id.clone(),
            kind: m.reported_kind(),
            detector: m.kind,
            confidence: m.confidence,
            transaction_ids: m.transaction_ids.clone(),
            summary: m.evidence.clone(),
            annotations: m.annotations.clone(),
        }
    }
}

/// Matches with intersecting entity sets, merged. Revised, never edited:
/// each change is a new revision listing what it supersedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub revision: u32,
    /// Reported kinds of the contributing matches
    pub kinds: BTreeSet<PatternKind>,
    pub entities: BTreeSet<String>,
    pub transaction_ids: BTreeSet<String>,
    pub match_ids: Vec<String>,
    /// Weighted maximum of contributing confidences
    pub score: Score,
    pub risk_level: RiskLevel,
    pub disposition: Disposition,
    pub evidence: Vec<CaseEvidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
    pub emitted_at: DateTime<Utc>,
}

impl Case {
    pub fn revision_id(&self) -> String {
        format!("{}-r{}", self.id, self.revision)
    }

    pub fn is_incomplete(&self) -> bool {
        self.evidence
            .iter()
            .any(|e| e.annotations.contains(&Annotation::IncompleteScan))
    }

    /// Same case content, ignoring revision links and emission time.
    pub fn same_content(&self, other: &Case) -> bool {
        self.id == other.id
            && self.kinds == other.kinds
            && self.entities == other.entities
            && self.transaction_ids == other.transaction_ids
            && self.match_ids == other.match_ids
            && self.score == other.score
            && self.disposition == other.disposition
            && self.evidence == other.evidence
    }

    /// Short human-readable headline.
    pub fn headline(&self) -> String {
        let kinds: Vec<&str> = self.kinds.iter().map(|k| k.as_str()).collect();
        format!(
            "{} [{}] score {} across {} entit{}",
            self.disposition.as_str(),
            kinds.join("+"),
            self.score.round_dp(2),
            self.entities.len(),
            if self.entities.len() == 1 { "y" } else { "ies" }
        )
    }
}

pub(crate) fn weighted_max(scores: impl Iterator<Item = Score>) -> Score {
    scores.fold(Decimal::ZERO, Decimal::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_disposition_transitions() {
        assert_eq!(Disposition::next(None, false, false), Disposition::Open);
        assert_eq!(Disposition::next(None, false, true), Disposition::Escalated);
        assert_eq!(Disposition::next(None, true, true), Disposition::ClosedBenign);
        assert_eq!(
            Disposition::next(Some(Disposition::Open), true, false),
            Disposition::ClosedBenign
        );
        assert_eq!(
            Disposition::next(Some(Disposition::Escalated), true, false),
            Disposition::Escalated
        );
        assert_eq!(
            Disposition::next(Some(Disposition::ClosedBenign), false, false),
            Disposition::Open
        );
    }

    #[test]
    fn test_threshold_escalation() {
        let policy = ThresholdEscalation {
            threshold: dec!(0.70),
        };
        assert!(policy.should_escalate(dec!(0.70), &[]));
        assert!(!policy.should_escalate(dec!(0.69), &[]));
    }

    #[test]
    fn test_weighted_max() {
        assert_eq!(
            weighted_max([dec!(0.3), dec!(0.8), dec!(0.5)].into_iter()),
            dec!(0.8)
        );
        assert_eq!(weighted_max(std::iter::empty()), Decimal::ZERO);
    }
}
