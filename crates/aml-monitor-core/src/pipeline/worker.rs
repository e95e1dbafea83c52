//! Threaded streaming monitor.
//!
//! ```text
//! submit ──▶ ingestion ──notify──▶ detector workers ──matches──▶ aggregation ──▶ updates
//!              │                     (one per detector)
//!              └──────── TransactionStore (shared, snapshot reads) ◀──┘
//! ```
//!
//! Channels are unbounded, so nothing is dropped. Shutdown closes the input
//! and each stage exits once its upstream is drained.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::{default_detectors, panic_reason, suppress};
use crate::aggregation::{AlertAggregator, Case};
use crate::config::MonitorConfig;
use crate::detection::{Detector, PatternKind, PatternMatch};
use crate::error::AmlError;
use crate::ledger::{StoreSnapshot, TransactionStore};
use crate::schema::{raw_record_id, IngestResult, TransactionRecord};
use crate::suppression::FalsePositiveSuppressor;
use crate::AmlResult;

/// A case revision published by the aggregation thread.
#[derive(Debug, Clone, Serialize)]
pub struct CaseUpdate {
    /// Detector whose run produced the revision
    pub detector: &'static str,
    /// Store sequence of the snapshot the run saw
    pub snapshot_sequence: u64,
    pub case: Case,
}

/// Everything the monitor held when it stopped.
pub struct MonitorState {
    pub aggregator: AlertAggregator,
    /// One result per submitted record, in submission order
    pub ingestion: Vec<IngestResult>,
    /// Updates not yet consumed from [`MonitorHandle::updates`]
    pub pending_updates: Vec<CaseUpdate>,
    /// `detector: reason` for every failed run
    pub failures: Vec<String>,
    pub snapshot: StoreSnapshot,
}

struct RunOutput {
    detector: &'static str,
    kind: PatternKind,
    snapshot_sequence: u64,
    matches: Vec<PatternMatch>,
    complete: bool,
}

enum StageMessage {
    Run(RunOutput),
    Failed { detector: &'static str, reason: String },
}

/// Handle to a running monitor.
pub struct MonitorHandle {
    input: Sender<Value>,
    updates: Receiver<CaseUpdate>,
    store: Arc<TransactionStore>,
    ingestion: JoinHandle<Vec<IngestResult>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    aggregation: JoinHandle<(AlertAggregator, Vec<String>)>,
}

/// Start a monitor with the feature-enabled detectors.
pub fn spawn_monitor(config: MonitorConfig) -> AmlResult<MonitorHandle> {
    let detectors = default_detectors(&config);
    spawn_monitor_with(config, detectors)
}

/// Start a monitor with an explicit detector set.
pub fn spawn_monitor_with(
    config: MonitorConfig,
    detectors: Vec<Arc<dyn Detector>>,
) -> AmlResult<MonitorHandle> {
    config.validate()?;

    let store = Arc::new(TransactionStore::new());
    let suppressor = Arc::new(FalsePositiveSuppressor::new(config.suppression.clone()));
    let (input_tx, input_rx) = unbounded::<Value>();
    let (stage_tx, stage_rx) = unbounded::<StageMessage>();
    let (update_tx, update_rx) = unbounded::<CaseUpdate>();

    let mut notifiers = Vec::with_capacity(detectors.len());
    let mut workers = Vec::with_capacity(detectors.len());
    for detector in detectors {
        let (notify_tx, notify_rx) = unbounded::<u64>();
        notifiers.push(notify_tx);
        let name = detector.name();
        let store = Arc::clone(&store);
        let suppressor = Arc::clone(&suppressor);
        let stage_tx = stage_tx.clone();
        workers.push((
            name,
            thread::spawn(move || detector_loop(detector, store, suppressor, notify_rx, stage_tx)),
        ));
    }
    drop(stage_tx);

    let ingest_store = Arc::clone(&store);
    let ingestion = thread::spawn(move || ingestion_loop(ingest_store, input_rx, notifiers));

    let aggregator = AlertAggregator::new(config.aggregation.clone());
    let aggregation = thread::spawn(move || aggregation_loop(aggregator, stage_rx, update_tx));

    info!(detectors = workers.len(), "monitor started");
    Ok(MonitorHandle {
        input: input_tx,
        updates: update_rx,
        store,
        ingestion,
        workers,
        aggregation,
    })
}

impl MonitorHandle {
    /// Queue one raw record for ingestion.
    pub fn submit(&self, record: Value) -> AmlResult<()> {
        self.input.send(record).map_err(|_| AmlError::DetectorFailure {
            detector: "ingestion".into(),
            reason: "ingestion thread has stopped".into(),
        })
    }

    /// Case revisions as they are published.
    pub fn updates(&self) -> &Receiver<CaseUpdate> {
        &self.updates
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    /// Close the input, let every stage drain, and return the final state.
    pub fn shutdown(self) -> AmlResult<MonitorState> {
        let MonitorHandle {
            input,
            updates,
            store,
            ingestion,
            workers,
            aggregation,
        } = self;
        drop(input);

        let ingestion = ingestion.join().map_err(|p| stage_failure("ingestion", p))?;
        let mut failures = Vec::new();
        for (name, handle) in workers {
            if let Err(p) = handle.join() {
                failures.push(format!("{name}: {}", panic_reason(p.as_ref())));
            }
        }
        let (aggregator, run_failures) =
            aggregation.join().map_err(|p| stage_failure("aggregation", p))?;
        failures.extend(run_failures);

        let pending_updates: Vec<CaseUpdate> = updates.try_iter().collect();
        info!(
            records = ingestion.len(),
            cases = aggregator.current_cases().len(),
            "monitor stopped"
        );
        Ok(MonitorState {
            aggregator,
            ingestion,
            pending_updates,
            failures,
            snapshot: store.snapshot(),
        })
    }
}

fn stage_failure(stage: &str, payload: Box<dyn std::any::Any + Send>) -> AmlError {
    AmlError::DetectorFailure {
        detector: stage.to_string(),
        reason: panic_reason(payload.as_ref()),
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn ingestion_loop(
    store: Arc<TransactionStore>,
    input: Receiver<Value>,
    notifiers: Vec<Sender<u64>>,
) -> Vec<IngestResult> {
    let mut results = Vec::new();
    for raw in input {
        let id = raw_record_id(&raw);
        let outcome = TransactionRecord::from_value(&raw)
            .and_then(TransactionRecord::into_transaction)
            .and_then(|tx| store.ingest(tx));
        match outcome {
            Ok(receipt) => {
                for notify in &notifiers {
                    let _ = notify.send(receipt.sequence);
                }
                results.push(IngestResult::accepted(receipt.transaction_id));
            }
            Err(err) => {
                if !matches!(err, AmlError::DuplicateId { .. }) {
                    warn!(transaction_id = id.as_deref().unwrap_or("<none>"), "record rejected: {err}");
                }
                results.push(IngestResult::from_error(id, &err));
            }
        }
    }
    results
}

fn detector_loop(
    detector: Arc<dyn Detector>,
    store: Arc<TransactionStore>,
    suppressor: Arc<FalsePositiveSuppressor>,
    notify: Receiver<u64>,
    stage: Sender<StageMessage>,
) {
    let name = detector.name();
    while let Ok(first) = notify.recv() {
        // Coalesce: one run covers every notification queued so far.
        let pending = 1 + notify.try_iter().count();
        let snapshot = store.snapshot();
        debug!(detector = name, notified_at = first, pending, sequence = snapshot.sequence(), "detector run");

        let outcome = catch_unwind(AssertUnwindSafe(|| detector.detect(&snapshot)))
            .unwrap_or_else(|p| {
                Err(AmlError::DetectorFailure {
                    detector: name.to_string(),
                    reason: panic_reason(p.as_ref()),
                })
            });

        let message = match outcome {
            Ok(report) => {
                for w in &report.warnings {
                    warn!(detector = name, "{w}");
                }
                StageMessage::Run(RunOutput {
                    detector: name,
                    kind: detector.kind(),
                    snapshot_sequence: snapshot.sequence(),
                    complete: !report.incomplete,
                    matches: suppress(&suppressor, report.matches, &snapshot),
                })
            }
            Err(err) => {
                warn!(detector = name, "{err}");
                StageMessage::Failed {
                    detector: name,
                    reason: err.to_string(),
                }
            }
        };
        if stage.send(message).is_err() {
            break;
        }
    }
}

fn aggregation_loop(
    mut aggregator: AlertAggregator,
    stage: Receiver<StageMessage>,
    updates: Sender<CaseUpdate>,
) -> (AlertAggregator, Vec<String>) {
    let mut failures = Vec::new();
    for message in stage {
        match message {
            StageMessage::Run(run) => {
                let delta = aggregator.submit_run(run.kind, run.matches, run.complete);
                for case in delta.cases {
                    let _ = updates.send(CaseUpdate {
                        detector: run.detector,
                        snapshot_sequence: run.snapshot_sequence,
                        case,
                    });
                }
            }
            StageMessage::Failed { detector, reason } => {
                failures.push(format!("{detector}: {reason}"));
            }
        }
    }
    (aggregator, failures)
}
