use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{default_detectors, panic_reason, suppress};
use crate::aggregation::{AggregationDelta, AlertAggregator, Case};
use crate::config::MonitorConfig;
use crate::detection::{Detector, DetectorReport, PatternMatch};
use crate::error::AmlError;
use crate::ledger::{StoreSnapshot, TransactionStore};
use crate::schema::{raw_record_id, CaseFeed, IngestResult, TransactionBatch, TransactionRecord};
use crate::suppression::FalsePositiveSuppressor;
use crate::types::{with_metadata, EngineOutput};
use crate::AmlResult;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    Completed,
    /// Stopped at its scan budget; partial matches were still aggregated
    Incomplete,
    /// Returned an error or panicked; nothing from it was aggregated
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorOutcome {
    pub detector: String,
    pub status: DetectorStatus,
    pub matches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub transactions_analyzed: usize,
    /// Live matches after aggregation
    pub matches_emitted: usize,
    /// Live matches demoted as likely legitimate
    pub matches_suppressed: usize,
    pub cases_by_disposition: BTreeMap<String, usize>,
    pub incomplete_detectors: Vec<String>,
    pub failed_detectors: Vec<String>,
    pub rejected_records: usize,
}

/// Result of one detection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Store sequence the run's snapshot was taken at
    pub snapshot_sequence: u64,
    pub detectors: Vec<DetectorOutcome>,
    /// Match revisions recorded by this run
    pub new_matches: Vec<PatternMatch>,
    /// Match ids retired by this run
    pub retired_matches: Vec<String>,
    /// Case revisions emitted by this run
    pub case_updates: Vec<Case>,
    pub summary: AnalysisSummary,
    pub warnings: Vec<String>,
}

/// Output of [`MonitoringEngine::scan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub ingestion: Vec<IngestResult>,
    pub summary: AnalysisSummary,
    pub detectors: Vec<DetectorOutcome>,
    pub feed: CaseFeed,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Batch monitoring engine: ingest, then run every detector over one snapshot.
pub struct MonitoringEngine {
    config: MonitorConfig,
    store: TransactionStore,
    detectors: Vec<Arc<dyn Detector>>,
    suppressor: FalsePositiveSuppressor,
    aggregator: AlertAggregator,
    rejected: usize,
}

impl MonitoringEngine {
    /// Engine with the feature-enabled detectors. Fails on invalid config.
    pub fn new(config: MonitorConfig) -> AmlResult<Self> {
        let detectors = default_detectors(&config);
        Self::with_detectors(config, detectors)
    }

    pub fn with_detectors(config: MonitorConfig, detectors: Vec<Arc<dyn Detector>>) -> AmlResult<Self> {
        config.validate()?;
        Ok(MonitoringEngine {
            suppressor: FalsePositiveSuppressor::new(config.suppression.clone()),
            aggregator: AlertAggregator::new(config.aggregation.clone()),
            store: TransactionStore::new(),
            detectors,
            config,
            rejected: 0,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn aggregator(&self) -> &AlertAggregator {
        &self.aggregator
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Validate and store one raw record.
    pub fn ingest_record(&mut self, raw: &Value) -> IngestResult {
        let id = raw_record_id(raw);
        let outcome = TransactionRecord::from_value(raw)
            .and_then(TransactionRecord::into_transaction)
            .and_then(|tx| self.store.ingest(tx));
        match outcome {
            Ok(receipt) => IngestResult::accepted(receipt.transaction_id),
            Err(err) => {
                match &err {
                    AmlError::DuplicateId { id } => {
                        debug!(transaction_id = %id, "duplicate record ignored");
                    }
                    _ => {
                        self.rejected += 1;
                        warn!(transaction_id = id.as_deref().unwrap_or("<none>"), "record rejected: {err}");
                    }
                }
                IngestResult::from_error(id, &err)
            }
        }
    }

    /// Ingest every record of a batch; one result per record, in input order.
    pub fn ingest_batch(&mut self, batch: &TransactionBatch) -> AmlResult<Vec<IngestResult>> {
        batch.check_version()?;
        Ok(batch.transactions.iter().map(|raw| self.ingest_record(raw)).collect())
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    /// Run every detector over a fresh snapshot, suppress and aggregate.
    ///
    /// Detectors run on scoped threads. One that errors or panics is reported
    /// as failed; the others are aggregated as usual.
    pub fn run_detection(&mut self) -> RunReport {
        let snapshot = self.store.snapshot();
        info!(
            transactions = snapshot.len(),
            detectors = self.detectors.len(),
            "detection run started"
        );

        let outcomes = run_detectors(&self.detectors, &snapshot);

        let mut report = RunReport {
            snapshot_sequence: snapshot.sequence(),
            detectors: Vec::new(),
            new_matches: Vec::new(),
            retired_matches: Vec::new(),
            case_updates: Vec::new(),
            summary: AnalysisSummary::default(),
            warnings: Vec::new(),
        };

        for (detector, (outcome, elapsed_us)) in self.detectors.iter().zip(outcomes) {
            let name = detector.name();
            match outcome {
                Ok(detected) => {
                    let status = if detected.incomplete {
                        DetectorStatus::Incomplete
                    } else {
                        DetectorStatus::Completed
                    };
                    info!(
                        detector = name,
                        matches = detected.matches.len(),
                        incomplete = detected.incomplete,
                        elapsed_us,
                        "detector finished"
                    );
                    report.detectors.push(DetectorOutcome {
                        detector: name.to_string(),
                        status,
                        matches: detected.matches.len(),
                        reason: None,
                        elapsed_us,
                    });
                    report
                        .warnings
                        .extend(detected.warnings.iter().map(|w| format!("{name}: {w}")));

                    let submissions = suppress(&self.suppressor, detected.matches, &snapshot);
                    let delta = self
                        .aggregator
                        .submit_run(detector.kind(), submissions, !detected.incomplete);
                    absorb(&mut report, delta);
                }
                Err(err) => {
                    warn!(detector = name, "{err}");
                    report.detectors.push(DetectorOutcome {
                        detector: name.to_string(),
                        status: DetectorStatus::Failed,
                        matches: 0,
                        reason: Some(err.to_string()),
                        elapsed_us,
                    });
                    report.warnings.push(err.to_string());
                }
            }
        }

        report.summary = self.summary(&snapshot, &report.detectors);
        info!(
            matches = report.summary.matches_emitted,
            suppressed = report.summary.matches_suppressed,
            case_updates = report.case_updates.len(),
            "detection run finished"
        );
        report
    }

    fn summary(&self, snapshot: &StoreSnapshot, outcomes: &[DetectorOutcome]) -> AnalysisSummary {
        let current = self.aggregator.current_matches();
        let names_with = |status: DetectorStatus| -> Vec<String> {
            outcomes
                .iter()
                .filter(|o| o.status == status)
                .map(|o| o.detector.clone())
                .collect()
        };
        AnalysisSummary {
            transactions_analyzed: snapshot.current_transactions().len(),
            matches_emitted: current.len(),
            matches_suppressed: current.iter().filter(|m| m.is_likely_legitimate()).count(),
            cases_by_disposition: self
                .aggregator
                .case_count_by_disposition()
                .into_iter()
                .map(|(d, n)| (d.as_str().to_string(), n))
                .collect(),
            incomplete_detectors: names_with(DetectorStatus::Incomplete),
            failed_detectors: names_with(DetectorStatus::Failed),
            rejected_records: self.rejected,
        }
    }

    /// Current case feed, ordered by case id.
    pub fn case_feed(&self) -> CaseFeed {
        CaseFeed::new(self.aggregator.current_cases().into_iter().cloned().collect())
    }

    /// Ingest a batch, run detection and wrap the case feed in the standard
    /// output envelope.
    pub fn scan(&mut self, batch: &TransactionBatch) -> AmlResult<EngineOutput<ScanResult>> {
        let start = Instant::now();
        let ingestion = self.ingest_batch(batch)?;
        let report = self.run_detection();

        let mut warnings: Vec<String> = ingestion
            .iter()
            .filter(|r| r.status == crate::schema::IngestStatus::Rejected)
            .map(|r| {
                format!(
                    "rejected {}: {}",
                    r.transaction_id.as_deref().unwrap_or("<no id>"),
                    r.reason.as_deref().unwrap_or("")
                )
            })
            .collect();
        warnings.extend(report.warnings);

        let result = ScanResult {
            ingestion,
            summary: report.summary,
            detectors: report.detectors,
            feed: self.case_feed(),
        };
        let elapsed = start.elapsed().as_micros() as u64;
        Ok(with_metadata(
            "Rule-based structuring windows, bounded fund-flow chain search and large-value \
             screening; legitimacy-based suppression; weighted-maximum case aggregation",
            &self.config,
            warnings,
            elapsed,
            result,
        ))
    }
}

/// Run each detector on its own scoped thread. Results come back in detector
/// order with the detector's wall time in microseconds.
fn run_detectors(
    detectors: &[Arc<dyn Detector>],
    snapshot: &StoreSnapshot,
) -> Vec<(AmlResult<DetectorReport>, u64)> {
    thread::scope(|scope| {
        let handles: Vec<_> = detectors
            .iter()
            .map(|d| {
                scope.spawn(move || {
                    let start = Instant::now();
                    let result = d.detect(snapshot);
                    (result, start.elapsed().as_micros() as u64)
                })
            })
            .collect();

        handles
            .into_iter()
            .zip(detectors)
            .map(|(handle, d)| match handle.join() {
                Ok(done) => done,
                Err(payload) => (
                    Err(AmlError::DetectorFailure {
                        detector: d.name().to_string(),
                        reason: panic_reason(payload.as_ref()),
                    }),
                    0,
                ),
            })
            .collect()
    })
}

fn absorb(report: &mut RunReport, delta: AggregationDelta) {
    report.new_matches.extend(delta.matches);
    report.retired_matches.extend(delta.retired);
    report.case_updates.extend(delta.cases);
}
