use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::{weighted_max, Case, CaseEvidence, Disposition, EscalationPolicy, ThresholdEscalation};
use crate::config::AggregationConfig;
use crate::detection::policy::RiskLevel;
use crate::detection::{MatchKey, PatternKind, PatternMatch};
use crate::types::{clamp_score, Score};

/// What one submission changed.
#[derive(Debug, Clone, Default)]
pub struct AggregationDelta {
    /// Newly recorded match revisions
    pub matches: Vec<PatternMatch>,
    /// Ids of matches whose evidence disappeared
    pub retired: Vec<String>,
    /// Newly emitted case revisions
    pub cases: Vec<Case>,
}

impl AggregationDelta {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.retired.is_empty() && self.cases.is_empty()
    }
}

/// Owns every Pattern Match and Case revision.
///
/// Matches are keyed by (kind, sorted transaction ids). Submitting content
/// already recorded for a key confirms it and records nothing, so replays and
/// re-runs are idempotent.
pub struct AlertAggregator {
    config: AggregationConfig,
    escalation: Arc<dyn EscalationPolicy>,
    matches: BTreeMap<MatchKey, Vec<PatternMatch>>,
    retired: BTreeSet<MatchKey>,
    cases: BTreeMap<String, Vec<Case>>,
    /// Ids of cases formed by the current matches
    active: BTreeSet<String>,
}

impl AlertAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        let escalation = Arc::new(ThresholdEscalation {
            threshold: config.escalation_threshold,
        });
        Self::with_policy(config, escalation)
    }

    pub fn with_policy(config: AggregationConfig, escalation: Arc<dyn EscalationPolicy>) -> Self {
        AlertAggregator {
            config,
            escalation,
            matches: BTreeMap::new(),
            retired: BTreeSet::new(),
            cases: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    fn kind_weight(&self, kind: PatternKind) -> Score {
        let w = &self.config.kind_weights;
        match kind {
            PatternKind::Structuring => w.structuring,
            PatternKind::Layering => w.layering,
            PatternKind::LargeValue => w.large_value,
            PatternKind::FalsePositiveSuppressed => w.large_value.min(w.structuring).min(w.layering),
        }
    }

    // -----------------------------------------------------------------------
    // Matches
    // -----------------------------------------------------------------------

    fn latest(&self, key: &MatchKey) -> Option<&PatternMatch> {
        self.matches.get(key).and_then(|h| h.last())
    }

    /// Append `m` as the next revision of its key. `linked` is the id of a
    /// retired match `m` replaces, used when the key has no history yet.
    fn record(&mut self, mut m: PatternMatch, linked: Option<String>) -> PatternMatch {
        let key = m.key();
        self.retired.remove(&key);
        let history = self.matches.entry(key).or_default();
        match history.last() {
            Some(latest) => {
                let (revision, supersedes) = (latest.revision + 1, Some(latest.id.clone()));
                m.restamp(revision, supersedes);
            }
            None => {
                let supersedes = linked.or(m.supersedes.take());
                m.restamp(m.revision.max(1), supersedes);
            }
        }
        debug!(match_id = %m.id, revision = m.revision, "match recorded");
        history.push(m.clone());
        m
    }

    /// Record a key's submissions in order. When the last of them already
    /// matches the latest recorded revision the whole group is a confirmation
    /// and nothing is recorded.
    fn record_group(
        &mut self,
        group: Vec<PatternMatch>,
        linked: Option<String>,
        delta: &mut AggregationDelta,
    ) {
        let Some(last) = group.last() else {
            return;
        };
        let key = last.key();
        if self.latest(&key).is_some_and(|l| l.same_content(last)) {
            self.retired.remove(&key);
            return;
        }
        let mut linked = linked;
        for m in group {
            if self.latest(&key).is_some_and(|l| l.same_content(&m)) {
                continue;
            }
            delta.matches.push(self.record(m, linked.take()));
        }
    }

    fn group_by_key(matches: Vec<PatternMatch>) -> BTreeMap<MatchKey, Vec<PatternMatch>> {
        let mut groups: BTreeMap<MatchKey, Vec<PatternMatch>> = BTreeMap::new();
        for m in matches {
            groups.entry(m.key()).or_default().push(m);
        }
        groups
    }

    /// Submit matches (a raw finding optionally followed by its suppressed
    /// revision) outside a full detector run. Nothing is retired.
    pub fn submit(&mut self, matches: Vec<PatternMatch>) -> AggregationDelta {
        let mut delta = AggregationDelta::default();
        for (_, group) in Self::group_by_key(matches) {
            self.record_group(group, None, &mut delta);
        }
        delta.cases = self.rebuild_cases();
        delta
    }

    /// Submit the complete output of one detector run.
    ///
    /// When `complete`, keys of `kind` absent from this run are retired: the
    /// evidence behind them no longer holds (e.g. a transaction was revised or
    /// a window grew). A new key overlapping a retired one links back to it.
    pub fn submit_run(
        &mut self,
        kind: PatternKind,
        matches: Vec<PatternMatch>,
        complete: bool,
    ) -> AggregationDelta {
        let mut delta = AggregationDelta::default();
        let groups = Self::group_by_key(matches);

        let retiring: Vec<MatchKey> = if complete {
            self.matches
                .keys()
                .filter(|k| k.kind == kind && !self.retired.contains(*k) && !groups.contains_key(*k))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        for (key, group) in groups {
            let linked = if self.matches.contains_key(&key) {
                None
            } else {
                retiring
                    .iter()
                    .find(|old| {
                        old.transaction_ids
                            .iter()
                            .any(|id| key.transaction_ids.binary_search(id).is_ok())
                    })
                    .and_then(|old| self.latest(old))
                    .map(|latest| latest.id.clone())
            };
            self.record_group(group, linked, &mut delta);
        }

        for key in retiring {
            if let Some(latest) = self.latest(&key) {
                debug!(match_id = %latest.id, "match retired");
                delta.retired.push(latest.id.clone());
            }
            self.retired.insert(key);
        }

        delta.cases = self.rebuild_cases();
        delta
    }

    /// Latest revision of every live match, in key order.
    pub fn current_matches(&self) -> Vec<&PatternMatch> {
        self.matches
            .iter()
            .filter(|(key, _)| !self.retired.contains(*key))
            .filter_map(|(_, history)| history.last())
            .collect()
    }

    pub fn match_history(&self, key: &MatchKey) -> &[PatternMatch] {
        self.matches.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total recorded match revisions, including superseded ones.
    pub fn match_revision_count(&self) -> usize {
        self.matches.values().map(Vec::len).sum()
    }

    // -----------------------------------------------------------------------
    // Cases
    // -----------------------------------------------------------------------

    /// Group live matches by intersecting entity sets (union-find) and emit a
    /// new revision for every case whose content changed.
    fn rebuild_cases(&mut self) -> Vec<Case> {
        let current: Vec<PatternMatch> = self.current_matches().into_iter().cloned().collect();

        let mut parent: Vec<usize> = (0..current.len()).collect();
        fn find(parent: &mut [usize], i: usize) -> usize {
            let mut root = i;
            while parent[root] != root {
                root = parent[root];
            }
            let mut node = i;
            while parent[node] != root {
                let next = parent[node];
                parent[node] = root;
                node = next;
            }
            root
        }

        let mut owner: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, m) in current.iter().enumerate() {
            for entity in &m.entities {
                match owner.get(entity.as_str()) {
                    Some(&j) => {
                        let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                        if a != b {
                            parent[a.max(b)] = a.min(b);
                        }
                    }
                    None => {
                        owner.insert(entity.as_str(), i);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<&PatternMatch>> = BTreeMap::new();
        for (i, m) in current.iter().enumerate() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(m);
        }

        let mut claimed: BTreeSet<String> = BTreeSet::new();
        let mut emitted = Vec::new();
        for members in groups.values() {
            let entities: BTreeSet<String> = members
                .iter()
                .flat_map(|m| m.entities.iter().cloned())
                .collect();
            let id = Self::case_id(members, &claimed);
            claimed.insert(id.clone());
            let replaced: Vec<&Case> = self
                .overlapping_active(&entities)
                .into_iter()
                .filter(|other| *other != id)
                .filter_map(|other| self.cases.get(&other).and_then(|h| h.last()))
                .collect();
            if let Some(case) = self.build_case(id, members, entities, &replaced) {
                emitted.push(case);
            }
        }

        for id in self.active.difference(&claimed) {
            debug!(case_id = %id, "case dissolved");
        }
        for case in &emitted {
            debug!(
                case_id = %case.id,
                revision = case.revision,
                disposition = case.disposition.as_str(),
                score = %case.score,
                "case revised"
            );
            self.cases.entry(case.id.clone()).or_default().push(case.clone());
        }
        self.active = claimed;
        emitted
    }

    /// Active case ids whose latest revision shares an entity with `entities`.
    fn overlapping_active(&self, entities: &BTreeSet<String>) -> Vec<String> {
        self.active
            .iter()
            .filter(|id| {
                self.cases
                    .get(*id)
                    .and_then(|h| h.last())
                    .is_some_and(|c| !c.entities.is_disjoint(entities))
            })
            .cloned()
            .collect()
    }

    /// Case id from content alone: the smallest digest among the group's
    /// match keys. The same final matches give the same id whatever order
    /// the evidence arrived in; continuity with earlier cases is carried by
    /// `supersedes`.
    fn case_id(members: &[&PatternMatch], claimed: &BTreeSet<String>) -> String {
        let digest = members
            .iter()
            .map(|m| m.key().digest())
            .min()
            .unwrap_or_default();
        let id = format!("case-{digest}");
        if claimed.contains(&id) {
            format!("{id}-{}", claimed.len())
        } else {
            id
        }
    }

    /// New revision of case `id` formed by `members`, or `None` when its latest
    /// revision already says the same.
    fn build_case(
        &self,
        id: String,
        members: &[&PatternMatch],
        entities: BTreeSet<String>,
        replaced: &[&Case],
    ) -> Option<Case> {
        let previous = self.cases.get(&id).and_then(|h| h.last());
        // Escalation survives a regrouping under a new id.
        let prior_disposition = if replaced.iter().any(|c| c.disposition == Disposition::Escalated) {
            Some(Disposition::Escalated)
        } else {
            previous.map(|c| c.disposition)
        };

        let score = clamp_score(weighted_max(
            members.iter().map(|m| self.kind_weight(m.reported_kind()) * m.confidence),
        ));
        let all_legitimate = members.iter().all(|m| m.is_likely_legitimate());
        let escalate = self.escalation.should_escalate(score, members);
        let disposition =
            Disposition::next(prior_disposition, all_legitimate, escalate);

        let mut match_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        match_ids.sort();

        let mut case = Case {
            id,
            revision: previous.map_or(1, |c| c.revision + 1),
            kinds: members.iter().map(|m| m.reported_kind()).collect(),
            entities,
            transaction_ids: members
                .iter()
                .flat_map(|m| m.transaction_ids.iter().cloned())
                .collect(),
            match_ids,
            score,
            risk_level: RiskLevel::from_score(score),
            disposition,
            evidence: members.iter().map(|m| CaseEvidence::from(*m)).collect(),
            supersedes: Vec::new(),
            emitted_at: Utc::now(),
        };

        let reactivated = !self.active.contains(&case.id);
        if replaced.is_empty() && !reactivated && previous.is_some_and(|p| p.same_content(&case)) {
            return None;
        }

        if let Some(p) = previous {
            case.supersedes.push(p.revision_id());
        }
        case.supersedes.extend(replaced.iter().map(|c| c.revision_id()));
        Some(case)
    }

    /// Latest revision of every active case, ordered by id.
    pub fn current_cases(&self) -> Vec<&Case> {
        self.active
            .iter()
            .filter_map(|id| self.cases.get(id).and_then(|h| h.last()))
            .collect()
    }

    pub fn case_history(&self, id: &str) -> &[Case] {
        self.cases.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn case_count_by_disposition(&self) -> BTreeMap<Disposition, usize> {
        let mut counts = BTreeMap::new();
        for case in self.current_cases() {
            *counts.entry(case.disposition).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Annotation;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn aggregator() -> AlertAggregator {
        AlertAggregator::new(AggregationConfig::default())
    }

    fn m(kind: PatternKind, ids: &[&str], entities: &[&str], confidence: Score) -> PatternMatch {
        PatternMatch::new(
            kind,
            ids.iter().copied(),
            entities.iter().map(|s| s.to_string()).collect(),
            confidence,
            format!("{kind} over {}", ids.join(",")),
        )
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let mut agg = aggregator();
        let first = agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1", "d2", "d3"], &["PV"], dec!(0.9))],
            true,
        );
        assert_eq!(first.matches.len(), 1);
        assert_eq!(first.cases.len(), 1);

        let again = agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d3", "d1", "d2"], &["PV"], dec!(0.9))],
            true,
        );
        assert!(again.is_empty());
        assert_eq!(agg.match_revision_count(), 1);
        assert_eq!(agg.current_cases().len(), 1);
        assert_eq!(agg.current_cases()[0].revision, 1);
    }

    #[test]
    fn test_overlapping_entities_merge_into_one_case() {
        let mut agg = aggregator();
        let first = agg.submit_run(
            PatternKind::Layering,
            vec![m(PatternKind::Layering, &["e1", "e3", "e5"], &["VGH", "LC", "APX", "OFF"], dec!(0.8))],
            true,
        );
        let first_case = first.cases[0].revision_id();
        agg.submit_run(
            PatternKind::LargeValue,
            vec![
                m(PatternKind::LargeValue, &["e1"], &["VGH", "LC"], dec!(0.6)),
                m(PatternKind::LargeValue, &["x9"], &["P", "Q"], dec!(0.4)),
            ],
            true,
        );

        let cases = agg.current_cases();
        assert_eq!(cases.len(), 2);
        let merged = cases.iter().find(|c| c.entities.contains("OFF")).unwrap();
        assert_eq!(merged.match_ids.len(), 2);
        // max(1.0 * 0.8, 0.6 * 0.6)
        assert_eq!(merged.score, dec!(0.8));
        assert_eq!(merged.disposition, Disposition::Escalated);
        assert_eq!(merged.risk_level, RiskLevel::Critical);
        assert_eq!(merged.supersedes, vec![first_case]);
        let smallest = [
            MatchKey::new(PatternKind::Layering, ["e1", "e3", "e5"]).digest(),
            MatchKey::new(PatternKind::LargeValue, ["e1"]).digest(),
        ]
        .into_iter()
        .min()
        .unwrap();
        assert_eq!(merged.id, format!("case-{smallest}"));

        let lone = cases.iter().find(|c| c.entities.contains("P")).unwrap();
        // 0.6 * 0.4
        assert_eq!(lone.score, dec!(0.24));
        assert_eq!(lone.disposition, Disposition::Open);
        assert_eq!(lone.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_all_legitimate_closes_benign() {
        let mut agg = aggregator();
        let raw = m(PatternKind::LargeValue, &["b1"], &["PMI", "HMC"], dec!(0.5));
        let mut demoted = raw.revise().with_annotation(Annotation::LikelyLegitimate);
        demoted.confidence = dec!(0.2);
        demoted.evidence = "demoted".into();

        let delta = agg.submit_run(PatternKind::LargeValue, vec![raw.clone(), demoted.clone()], true);
        assert_eq!(delta.matches.len(), 2);
        assert_eq!(delta.matches[1].supersedes.as_deref(), Some(raw.id.as_str()));

        let cases = agg.current_cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].disposition, Disposition::ClosedBenign);
        assert!(cases[0].kinds.contains(&PatternKind::FalsePositiveSuppressed));

        // Replaying the same pair records nothing
        let replay = agg.submit_run(PatternKind::LargeValue, vec![raw, demoted], true);
        assert!(replay.is_empty());
    }

    #[test]
    fn test_changed_evidence_supersedes() {
        let mut agg = aggregator();
        let first = agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1", "d2", "d3", "d4"], &["PV"], dec!(0.6))],
            true,
        );
        let delta = agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1", "d2", "d3", "d4", "d5"], &["PV"], dec!(0.9))],
            true,
        );
        assert_eq!(delta.retired.len(), 1);
        let new = &delta.matches[0];
        assert_eq!(new.revision, 1);
        assert_eq!(new.supersedes.as_deref(), Some(delta.retired[0].as_str()));
        assert_eq!(agg.current_matches().len(), 1);

        // New content, new id; the earlier case is linked and kept in history
        let old_case = &first.cases[0];
        let case = agg.current_cases()[0];
        assert_ne!(case.id, old_case.id);
        assert_eq!(case.revision, 1);
        assert_eq!(case.supersedes, vec![old_case.revision_id()]);
        assert_eq!(case.disposition, Disposition::Escalated);
        assert_eq!(agg.current_cases().len(), 1);
        assert_eq!(agg.case_history(&old_case.id).len(), 1);
    }

    #[test]
    fn test_case_id_ignores_arrival_order() {
        let deposits = ["d1", "d2", "d3", "d4", "d5"];
        let run = |order: &[usize]| {
            let mut agg = aggregator();
            let mut seen: Vec<&str> = Vec::new();
            for &i in order {
                seen.push(deposits[i]);
                if seen.len() >= 3 {
                    agg.submit_run(
                        PatternKind::Structuring,
                        vec![m(PatternKind::Structuring, &seen, &["PV"], dec!(0.9))],
                        true,
                    );
                }
            }
            let case = agg.current_cases()[0].clone();
            (case.id, case.match_ids, case.disposition)
        };
        let forward = run(&[0, 1, 2, 3, 4]);
        assert_eq!(forward, run(&[4, 3, 2, 1, 0]));
        assert_eq!(forward, run(&[2, 0, 4, 1, 3]));
        assert_eq!(
            forward.0,
            format!("case-{}", MatchKey::new(PatternKind::Structuring, deposits).digest())
        );
    }

    #[test]
    fn test_escalation_survives_regrouping() {
        let mut agg = aggregator();
        agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1", "d2", "d3"], &["PV"], dec!(0.9))],
            true,
        );
        // Weaker evidence under a new key replaces the escalated case
        agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1", "d2", "d3", "d4"], &["PV"], dec!(0.3))],
            true,
        );
        let case = agg.current_cases()[0];
        assert_eq!(case.revision, 1);
        assert_eq!(case.disposition, Disposition::Escalated);
    }

    #[test]
    fn test_incomplete_run_retires_nothing() {
        let mut agg = aggregator();
        agg.submit_run(
            PatternKind::Layering,
            vec![m(PatternKind::Layering, &["a", "b", "c"], &["A", "B", "C", "D"], dec!(0.7))],
            true,
        );
        let delta = agg.submit_run(PatternKind::Layering, Vec::new(), false);
        assert!(delta.retired.is_empty());
        assert_eq!(agg.current_matches().len(), 1);
    }

    #[test]
    fn test_escalation_is_sticky() {
        let mut agg = aggregator();
        agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1"], &["PV"], dec!(0.9))],
            true,
        );
        agg.submit_run(
            PatternKind::Structuring,
            vec![m(PatternKind::Structuring, &["d1"], &["PV"], dec!(0.3))],
            true,
        );
        let case = agg.current_cases()[0];
        assert_eq!(case.revision, 2);
        assert_eq!(case.disposition, Disposition::Escalated);
        assert_eq!(agg.case_history(&case.id).len(), 2);
    }
}
