use clap::Args;
use serde_json::{json, Map, Value};
use tracing::info;

use aml_monitor_core::config::MonitorConfig;
use aml_monitor_core::pipeline::MonitoringEngine;
use aml_monitor_core::schema::{IngestStatus, TransactionBatch, SCHEMA_VERSION};

use crate::input;

/// Arguments for a full monitoring run
#[derive(Args)]
pub struct ScanArgs {
    /// Path to JSON input file (batch envelope, record array, or named sets)
    #[arg(long)]
    pub input: Option<String>,
    /// Named set to scan when the input holds several
    #[arg(long)]
    pub set: Option<String>,
    /// Path to a YAML or JSON configuration file
    #[arg(long)]
    pub config: Option<String>,
}

/// Arguments for ingestion-only validation
#[derive(Args)]
pub struct IngestArgs {
    /// Path to JSON input file
    #[arg(long)]
    pub input: Option<String>,
    /// Named set to validate when the input holds several
    #[arg(long)]
    pub set: Option<String>,
}

pub(crate) fn load_config(path: Option<&str>) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(p) => input::file::read_config(p)?,
        None => MonitorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// One value per batch; several batches become a map keyed by set name.
fn collect<F>(
    batches: Vec<(String, TransactionBatch)>,
    mut run: F,
) -> Result<Value, Box<dyn std::error::Error>>
where
    F: FnMut(&TransactionBatch) -> Result<Value, Box<dyn std::error::Error>>,
{
    if batches.len() == 1 {
        return run(&batches[0].1);
    }
    let mut sets = Map::new();
    for (name, batch) in &batches {
        sets.insert(name.clone(), run(batch)?);
    }
    Ok(json!({ "sets": sets }))
}

pub fn run_scan(args: ScanArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let document = input::read_document(args.input.as_deref(), "scan")?;
    let batches = input::batches(document, args.set.as_deref())?;

    // Each set gets its own engine so sets never see each other's history.
    info!(sets = batches.len(), "scanning input");
    collect(batches, |batch| {
        let mut engine = MonitoringEngine::new(config.clone())?;
        let output = engine.scan(batch)?;
        Ok(serde_json::to_value(output)?)
    })
}

pub fn run_ingest(args: IngestArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let document = input::read_document(args.input.as_deref(), "ingest")?;
    let batches = input::batches(document, args.set.as_deref())?;

    collect(batches, |batch| {
        let mut engine = MonitoringEngine::new(MonitorConfig::default())?;
        let results = engine.ingest_batch(batch)?;
        let count = |status: IngestStatus| results.iter().filter(|r| r.status == status).count();
        Ok(json!({
            "schema_version": SCHEMA_VERSION,
            "accepted": count(IngestStatus::Accepted),
            "duplicate": count(IngestStatus::Duplicate),
            "rejected": count(IngestStatus::Rejected),
            "results": results,
        }))
    })
}
