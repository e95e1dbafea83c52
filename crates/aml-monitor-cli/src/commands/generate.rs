use clap::{Args, ValueEnum};
use serde_json::Value;

use aml_monitor_core::synthetic;

#[derive(Debug, Clone, ValueEnum)]
pub enum SyntheticKind {
    /// Densely connected wire network (layering stress)
    Dense,
    /// Cash deposit traffic with planted structuring bursts
    Structuring,
}

/// Arguments for synthetic batch generation
#[derive(Args)]
pub struct GenerateArgs {
    #[arg(long, value_enum, default_value = "dense")]
    pub kind: SyntheticKind,
    /// Number of accounts
    #[arg(long, default_value_t = 50)]
    pub accounts: usize,
    /// Transfers per account (dense only)
    #[arg(long, default_value_t = 5)]
    pub per_account: usize,
    /// RNG seed; the same seed reproduces the same batch
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

pub fn run_generate(args: GenerateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let generated = match args.kind {
        SyntheticKind::Dense => synthetic::dense_graph(args.accounts, args.per_account, args.seed)?,
        SyntheticKind::Structuring => synthetic::structuring_bursts(args.accounts, args.seed)?,
    };
    Ok(serde_json::to_value(generated.batch)?)
}
