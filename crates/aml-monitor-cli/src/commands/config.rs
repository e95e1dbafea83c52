use clap::Args;
use serde_json::Value;

use super::monitor::load_config;

/// Arguments for printing the effective configuration
#[derive(Args)]
pub struct ConfigArgs {
    /// Path to a YAML or JSON configuration file (defaults when omitted)
    #[arg(long)]
    pub config: Option<String>,
}

pub fn run_config(args: ConfigArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    Ok(serde_json::to_value(config)?)
}
