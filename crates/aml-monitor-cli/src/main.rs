mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;

use commands::config::ConfigArgs;
use commands::generate::GenerateArgs;
use commands::monitor::{IngestArgs, ScanArgs};

/// Anti-money-laundering transaction monitoring
#[derive(Parser)]
#[command(
    name = "amlm",
    version,
    about = "Anti-money-laundering transaction monitoring",
    long_about = "Runs structuring, layering and large-value detection over batches of \
                  transaction records, suppresses likely-legitimate business activity, \
                  and prints the resulting case feed with decimal precision."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log filter directive (e.g. `aml_monitor_core=debug`), overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a transaction batch, run every detector and print the case feed
    Scan(ScanArgs),
    /// Validate a transaction batch and report per-record ingestion results
    Ingest(IngestArgs),
    /// Print the effective configuration after validation
    Config(ConfigArgs),
    /// Emit a seeded synthetic transaction batch
    Generate(GenerateArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

const DEFAULT_LOG_DIRECTIVE: &str = "aml_monitor_core=warn";

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(directive) => tracing_subscriber::EnvFilter::new(directive),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_DIRECTIVE)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Scan(args) => commands::monitor::run_scan(args),
        Commands::Ingest(args) => commands::monitor::run_ingest(args),
        Commands::Config(args) => commands::config::run_config(args),
        Commands::Generate(args) => commands::generate::run_generate(args),
        Commands::Version => {
            println!("amlm {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
