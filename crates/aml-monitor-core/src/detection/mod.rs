//! Detector contract and the Pattern Match record every detector emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::ledger::StoreSnapshot;
use crate::types::{clamp_score, Score};
use crate::AmlResult;

pub mod policy;

#[cfg(feature = "structuring")]
pub mod structuring;

#[cfg(feature = "layering")]
pub mod layering;

#[cfg(feature = "large_value")]
pub mod large_value;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Structuring,
    Layering,
    LargeValue,
    FalsePositiveSuppressed,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Structuring => "structuring",
            PatternKind::Layering => "layering",
            PatternKind::LargeValue => "large_value",
            PatternKind::FalsePositiveSuppressed => "false_positive_suppressed",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Annotation {
    /// Demoted by the false-positive suppressor
    LikelyLegitimate,
    /// Produced by a search that ran out of budget
    IncompleteScan,
}

// ---------------------------------------------------------------------------
// Match identity
// ---------------------------------------------------------------------------

/// Identity of a match across re-computations: pattern kind plus the sorted
/// set of participating transaction ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub kind: PatternKind,
    pub transaction_ids: Vec<String>,
}

impl MatchKey {
    pub fn new<I, S>(kind: PatternKind, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        MatchKey {
            kind,
            transaction_ids: set.into_iter().collect(),
        }
    }

    /// Stable short digest, used to derive match and case ids.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        for id in &self.transaction_ids {
            hasher.update(b"|");
            hasher.update(id.as_bytes());
        }
        let full = format!("{:x}", hasher.finalize());
        full[..16].to_string()
    }

    pub fn match_id(&self, revision: u32) -> String {
        format!("{}-{}-r{}", self.kind, self.digest(), revision)
    }
}

// ---------------------------------------------------------------------------
// Pattern match
// ---------------------------------------------------------------------------

/// A detector finding. Never mutated after emission: new evidence produces a
/// new revision whose `supersedes` points at the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: String,
    /// Kind of the detector that produced the finding
    pub kind: PatternKind,
    pub revision: u32,
    /// Sorted, de-duplicated
    pub transaction_ids: Vec<String>,
    /// Involved account ids
    pub entities: BTreeSet<String>,
    pub confidence: Score,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub annotations: BTreeSet<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl PatternMatch {
    pub fn new<I, S>(
        kind: PatternKind,
        transaction_ids: I,
        entities: BTreeSet<String>,
        confidence: Score,
        evidence: String,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = MatchKey::new(kind, transaction_ids);
        PatternMatch {
            id: key.match_id(1),
            kind,
            revision: 1,
            transaction_ids: key.transaction_ids,
            entities,
            confidence: clamp_score(confidence),
            evidence,
            annotations: BTreeSet::new(),
            supersedes: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn key(&self) -> MatchKey {
        MatchKey {
            kind: self.kind,
            transaction_ids: self.transaction_ids.clone(),
        }
    }

    /// Kind reported downstream; demoted matches report as suppressed.
    pub fn reported_kind(&self) -> PatternKind {
        if self.is_likely_legitimate() {
            PatternKind::FalsePositiveSuppressed
        } else {
            self.kind
        }
    }

    pub fn is_likely_legitimate(&self) -> bool {
        self.annotations.contains(&Annotation::LikelyLegitimate)
    }

    pub fn is_incomplete(&self) -> bool {
        self.annotations.contains(&Annotation::IncompleteScan)
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.insert(annotation);
        self
    }

    /// Next revision of this finding, linked back to it.
    pub fn revise(&self) -> PatternMatch {
        let revision = self.revision + 1;
        PatternMatch {
            id: self.key().match_id(revision),
            revision,
            supersedes: Some(self.id.clone()),
            emitted_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Re-stamp identity fields, keeping content.
    pub(crate) fn restamp(&mut self, revision: u32, supersedes: Option<String>) {
        self.revision = revision;
        self.id = self.key().match_id(revision);
        self.supersedes = supersedes;
    }

    /// Same finding content, ignoring identity and emission time.
    pub fn same_content(&self, other: &PatternMatch) -> bool {
        self.kind == other.kind
            && self.transaction_ids == other.transaction_ids
            && self.entities == other.entities
            && self.confidence == other.confidence
            && self.evidence == other.evidence
            && self.annotations == other.annotations
    }
}

// ---------------------------------------------------------------------------
// Detector contract
// ---------------------------------------------------------------------------

/// Output of one detector over one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorReport {
    pub matches: Vec<PatternMatch>,
    pub warnings: Vec<String>,
    /// The detector stopped early; absent keys must not be read as cleared
    pub incomplete: bool,
}

/// A pattern detector. Detectors are independent of each other and only see
/// an immutable snapshot of the store.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> PatternKind;

    fn detect(&self, snapshot: &StoreSnapshot) -> AmlResult<DetectorReport>;
}

/// Sort matches by kind then transaction ids so output never depends on
/// arrival or thread order.
pub fn sort_matches(matches: &mut [PatternMatch]) {
    matches.sort_by(|a, b| {
        (a.kind, &a.transaction_ids).cmp(&(b.kind, &b.transaction_ids))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entities(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_is_order_insensitive() {
        let a = MatchKey::new(PatternKind::Layering, ["t3", "t1", "t2"]);
        let b = MatchKey::new(PatternKind::Layering, ["t1", "t2", "t3", "t2"]);
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 16);
        let c = MatchKey::new(PatternKind::Structuring, ["t1", "t2", "t3"]);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_new_match_clamps_and_sorts() {
        let m = PatternMatch::new(
            PatternKind::Structuring,
            ["b", "a"],
            entities(&["ACC"]),
            dec!(1.7),
            "x".into(),
        );
        assert_eq!(m.transaction_ids, vec!["a", "b"]);
        assert_eq!(m.confidence, dec!(1));
        assert_eq!(m.revision, 1);
        assert!(m.id.starts_with("structuring-"));
        assert!(m.id.ends_with("-r1"));
    }

    #[test]
    fn test_revise_links_previous() {
        let m = PatternMatch::new(
            PatternKind::LargeValue,
            ["t1"],
            entities(&["A", "B"]),
            dec!(0.4),
            "x".into(),
        );
        let r = m.revise().with_annotation(Annotation::LikelyLegitimate);
        assert_eq!(r.revision, 2);
        assert_eq!(r.supersedes.as_deref(), Some(m.id.as_str()));
        assert_eq!(r.key(), m.key());
        assert_eq!(r.reported_kind(), PatternKind::FalsePositiveSuppressed);
        assert_eq!(m.reported_kind(), PatternKind::LargeValue);
        assert!(!r.same_content(&m));
        assert!(m.same_content(&m.revise()));
    }
}
