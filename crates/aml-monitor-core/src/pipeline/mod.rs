//! Wiring between the store, detectors, suppressor and aggregator.
//!
//! [`engine::MonitoringEngine`] runs every detector over one snapshot and
//! returns when aggregation is done. [`worker::spawn_monitor`] does the same
//! continuously on background threads.

use std::any::Any;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::detection::{sort_matches, Detector, PatternMatch};
use crate::ledger::StoreSnapshot;
use crate::suppression::FalsePositiveSuppressor;

pub mod engine;
pub mod worker;

pub use engine::{AnalysisSummary, DetectorOutcome, DetectorStatus, MonitoringEngine, RunReport, ScanResult};
pub use worker::{spawn_monitor, CaseUpdate, MonitorHandle, MonitorState};

/// Detectors enabled by the crate features, configured from `config`.
pub fn default_detectors(config: &MonitorConfig) -> Vec<Arc<dyn Detector>> {
    #[allow(unused_mut)]
    let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
    #[cfg(feature = "structuring")]
    detectors.push(Arc::new(crate::detection::structuring::StructuringDetector::new(
        config.structuring.clone(),
    )));
    #[cfg(feature = "layering")]
    detectors.push(Arc::new(crate::detection::layering::LayeringDetector::new(
        config.layering.clone(),
    )));
    #[cfg(feature = "large_value")]
    detectors.push(Arc::new(crate::detection::large_value::LargeValueDetector::new(
        config.large_value.clone(),
    )));
    let _ = config;
    detectors
}

/// Run raw detector matches through the suppressor. Each raw match is kept,
/// followed by its demoted revision when the suppressor produced one, so the
/// aggregator records the supersede link. The sort is stable, so that pairing
/// survives it.
pub(crate) fn suppress(
    suppressor: &FalsePositiveSuppressor,
    matches: Vec<PatternMatch>,
    snapshot: &StoreSnapshot,
) -> Vec<PatternMatch> {
    let mut out = Vec::with_capacity(matches.len());
    for raw in matches {
        let demoted = suppressor.apply(raw.clone(), snapshot);
        let changed = demoted.id != raw.id;
        out.push(raw);
        if changed {
            out.push(demoted);
        }
    }
    sort_matches(&mut out);
    out
}

/// Readable reason from a panic payload.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
