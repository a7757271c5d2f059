//! Command Line Interface (CLI) arguments.

use clap::Parser;
use std::path::PathBuf;

/// Powder reduction command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// Path to the reduction request (JSON)
    #[arg(long, env = "POWDER_REDUCTION_REQUEST")]
    pub request: PathBuf,
    /// Directory holding the raw run files
    #[arg(long, default_value = ".", env = "POWDER_REDUCTION_DATA_DIR")]
    pub data_dir: PathBuf,
    /// Number of workers reducing each run. More than one worker reduces chunks concurrently.
    #[arg(long, default_value_t = 1, env = "POWDER_REDUCTION_WORKERS")]
    pub workers: usize,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "POWDER_REDUCTION_USE_RAYON")]
    pub use_rayon: bool,
    /// File to write Prometheus metrics to when the job finishes
    #[arg(long, env = "POWDER_REDUCTION_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,
    /// Log more detail; repeat for trace logging. `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, default_value_t = false, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
