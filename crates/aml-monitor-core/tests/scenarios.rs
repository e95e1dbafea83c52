use aml_monitor_core::aggregation::{Case, Disposition};
use aml_monitor_core::config::MonitorConfig;
use aml_monitor_core::detection::{Annotation, PatternKind};
use aml_monitor_core::pipeline::{DetectorStatus, MonitoringEngine};
use aml_monitor_core::schema::{IngestStatus, TransactionBatch};
use aml_monitor_core::synthetic;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sample_sets() -> BTreeMap<String, TransactionBatch> {
    serde_json::from_str(include_str!("fixtures/sample_transactions.json")).unwrap()
}

fn sample(name: &str) -> TransactionBatch {
    sample_sets().remove(name).unwrap()
}

fn engine() -> MonitoringEngine {
    MonitoringEngine::new(MonitorConfig::default()).unwrap()
}

fn scan_cases(batch: &TransactionBatch) -> Vec<Case> {
    engine().scan(batch).unwrap().result.feed.cases
}

/// Case content with emission timestamps stripped.
fn fingerprint(cases: &[Case]) -> Vec<Value> {
    cases
        .iter()
        .map(|c| {
            let mut v = serde_json::to_value(c).unwrap();
            v.as_object_mut().unwrap().remove("emitted_at");
            v
        })
        .collect()
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Labeled sets
// ---------------------------------------------------------------------------

#[test]
fn test_structuring_set_escalates() {
    let cases = scan_cases(&sample("structuring"));
    assert_eq!(cases.len(), 1);

    let case = &cases[0];
    assert_eq!(case.kinds, BTreeSet::from([PatternKind::Structuring]));
    assert_eq!(case.disposition, Disposition::Escalated);
    assert_eq!(case.entities, BTreeSet::from(["PV-4410".to_string()]));
    assert_eq!(
        case.transaction_ids.iter().cloned().collect::<Vec<_>>(),
        ids(&["STR-2001", "STR-2002", "STR-2003", "STR-2004"])
    );
    assert!(case.evidence[0]
        .summary
        .starts_with("4 deposits totaling $39,500 across 4 channels"));
}

#[test]
fn test_layering_set_merges_chains_into_one_case() {
    let mut engine = engine();
    let output = engine.scan(&sample("layering")).unwrap();
    let cases = &output.result.feed.cases;
    assert_eq!(cases.len(), 1);

    let case = &cases[0];
    assert_eq!(case.disposition, Disposition::Escalated);
    assert!(case.kinds.contains(&PatternKind::Layering));
    assert!(case.kinds.contains(&PatternKind::LargeValue));
    assert_eq!(case.entities.len(), 6);

    let chains: Vec<&Vec<String>> = case
        .evidence
        .iter()
        .filter(|e| e.kind == PatternKind::Layering)
        .map(|e| &e.transaction_ids)
        .collect();
    assert_eq!(
        chains,
        vec![
            &ids(&["LAY-3001", "LAY-3002", "LAY-3004"]),
            &ids(&["LAY-3001", "LAY-3003", "LAY-3005"]),
        ]
    );
    assert!(output.result.summary.failed_detectors.is_empty());
}

#[test]
fn test_business_payments_close_benign() {
    let mut engine = engine();
    let output = engine.scan(&sample("false_positive")).unwrap();
    let cases = &output.result.feed.cases;
    assert_eq!(cases.len(), 1);

    let case = &cases[0];
    assert_eq!(case.disposition, Disposition::ClosedBenign);
    assert_eq!(case.kinds, BTreeSet::from([PatternKind::FalsePositiveSuppressed]));
    assert!(case
        .evidence
        .iter()
        .all(|e| e.annotations.contains(&Annotation::LikelyLegitimate)
            && e.detector == PatternKind::LargeValue));
    assert_eq!(output.result.summary.matches_suppressed, 3);

    // Unknown fields survive ingestion as metadata
    let snapshot = engine.store().snapshot();
    let tx = snapshot.get("B2B-1003").unwrap();
    assert_eq!(tx.metadata.get("erp_batch"), Some(&json!("AP-2024-11")));
}

#[test]
fn test_all_sets_in_one_batch() {
    let mut combined = TransactionBatch::default();
    for (_, batch) in sample_sets() {
        combined.transactions.extend(batch.transactions);
    }
    let cases = scan_cases(&combined);
    assert_eq!(cases.len(), 3);

    let mut by_disposition: BTreeMap<Disposition, usize> = BTreeMap::new();
    for c in &cases {
        *by_disposition.entry(c.disposition).or_default() += 1;
    }
    assert_eq!(by_disposition.get(&Disposition::Escalated), Some(&2));
    assert_eq!(by_disposition.get(&Disposition::ClosedBenign), Some(&1));
}

#[test]
fn test_case_feed_wire_shape() {
    let mut engine = engine();
    engine.scan(&sample("structuring")).unwrap();
    let feed = serde_json::to_value(engine.case_feed()).unwrap();
    assert_eq!(feed["schema_version"], "aml.v1");
    assert_eq!(feed["cases"][0]["disposition"], "escalated");
    assert_eq!(feed["cases"][0]["kinds"], json!(["structuring"]));
    assert!(feed["cases"][0]["risk_level"].is_string());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn test_reingesting_batch_is_idempotent() {
    for (name, batch) in sample_sets() {
        let mut engine = engine();
        let first = engine.scan(&batch).unwrap();
        let revisions = engine.aggregator().match_revision_count();

        let second = engine.scan(&batch).unwrap();
        assert!(
            second
                .result
                .ingestion
                .iter()
                .all(|r| r.status == IngestStatus::Duplicate),
            "set {name}"
        );
        assert_eq!(
            fingerprint(&first.result.feed.cases),
            fingerprint(&second.result.feed.cases),
            "set {name}"
        );
        assert_eq!(engine.aggregator().match_revision_count(), revisions);
    }
}

#[test]
fn test_shuffled_arrival_gives_same_cases() {
    for (name, batch) in sample_sets() {
        let expected = fingerprint(&scan_cases(&batch));
        for seed in 1..=5u64 {
            let mut shuffled = batch.clone();
            shuffled
                .transactions
                .shuffle(&mut StdRng::seed_from_u64(seed));
            assert_eq!(
                fingerprint(&scan_cases(&shuffled)),
                expected,
                "set {name}, seed {seed}"
            );
        }
    }
}

/// Case identity and content, without revision bookkeeping.
fn outcome(cases: &[Case]) -> Vec<Value> {
    cases
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "kinds": c.kinds,
                "entities": c.entities,
                "transaction_ids": c.transaction_ids,
                "disposition": c.disposition,
            })
        })
        .collect()
}

#[test]
fn test_detection_per_record_matches_batch_in_any_order() {
    for name in ["structuring", "layering"] {
        let batch = sample(name);
        let expected = outcome(&scan_cases(&batch));
        assert!(!expected.is_empty());

        let mut orders = vec![batch.transactions.clone()];
        let mut reversed = batch.transactions.clone();
        reversed.reverse();
        orders.push(reversed);
        for seed in 1..=3u64 {
            let mut shuffled = batch.transactions.clone();
            shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
            orders.push(shuffled);
        }

        for (n, order) in orders.iter().enumerate() {
            let mut engine = engine();
            for raw in order {
                assert_eq!(engine.ingest_record(raw).status, IngestStatus::Accepted);
                engine.run_detection();
            }
            let cases: Vec<Case> = engine.case_feed().cases;
            assert_eq!(outcome(&cases), expected, "set {name}, order {n}");
        }
    }
}

#[test]
fn test_correction_retires_stale_match() {
    let mut engine = engine();
    engine.scan(&sample("structuring")).unwrap();
    let case_id = engine.case_feed().cases[0].id.clone();

    // Teller keyed the last deposit wrong; the correction drops it out of band
    let correction = json!({
        "transaction_id": "STR-2004-C",
        "supersedes": "STR-2004",
        "timestamp": "2024-03-05T10:20:00Z",
        "amount": "4850.00",
        "sender": {"name": "Peter Vance", "account_id": "PV-4410"},
        "receiver": {"name": "Peter Vance", "account_id": "PV-4410"},
        "transaction_type": "cash_deposit",
        "source_system": "branch_teller",
        "branch": "Airport"
    });
    assert_eq!(engine.ingest_record(&correction).status, IngestStatus::Accepted);

    let report = engine.run_detection();
    assert_eq!(report.retired_matches.len(), 1);
    assert!(engine.case_feed().cases.is_empty());
    // History is kept; nothing was edited in place
    assert_eq!(engine.aggregator().case_history(&case_id).len(), 1);
    assert_eq!(
        engine.aggregator().case_history(&case_id)[0].disposition,
        Disposition::Escalated
    );
}

#[test]
fn test_self_transfers_never_in_layering_chains() {
    let mut batch = synthetic::dense_graph(30, 4, 3).unwrap().batch;
    batch
        .transactions
        .extend(synthetic::structuring_bursts(30, 3).unwrap().batch.transactions);

    let mut engine = engine();
    engine.scan(&batch).unwrap();
    let snapshot = engine.store().snapshot();
    for m in engine.aggregator().current_matches() {
        if m.kind != PatternKind::Layering {
            continue;
        }
        for id in &m.transaction_ids {
            assert!(!snapshot.get(id).unwrap().is_self_transfer(), "{id} in {}", m.id);
        }
    }
}

#[test]
fn test_dense_graph_stops_at_budget() {
    let mut config = MonitorConfig::default();
    config.layering.scan_budget = 1_000;
    let mut engine = MonitoringEngine::new(config).unwrap();

    let batch = synthetic::dense_graph(200, 20, 11).unwrap().batch;
    let output = engine.scan(&batch).unwrap();

    let layering = output
        .result
        .detectors
        .iter()
        .find(|d| d.detector == "layering")
        .unwrap();
    assert_eq!(layering.status, DetectorStatus::Incomplete);
    assert_eq!(output.result.summary.incomplete_detectors, vec!["layering".to_string()]);
    assert!(output
        .warnings
        .iter()
        .any(|w| w.contains("Scan budget exceeded")));
    for m in engine.aggregator().current_matches() {
        if m.kind == PatternKind::Layering {
            assert!(m.is_incomplete());
        }
    }
}

#[test]
fn test_planted_structuring_bursts_are_found() {
    let generated = synthetic::structuring_bursts(40, 21).unwrap();
    let cases = scan_cases(&generated.batch);

    let flagged: BTreeSet<String> = cases
        .iter()
        .filter(|c| c.kinds.contains(&PatternKind::Structuring))
        .flat_map(|c| c.entities.iter().cloned())
        .collect();
    let planted: BTreeSet<String> = generated.planted_accounts.into_iter().collect();
    assert_eq!(flagged, planted);
}
