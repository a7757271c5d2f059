//! This file defines the powder-reduction binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use powder_reduction::cli;
use powder_reduction::error::ReductionError;
use powder_reduction::loader::FileLoader;
use powder_reduction::metrics;
use powder_reduction::models::ReductionRequest;
use powder_reduction::reducer::{self, ReductionSummary};
use powder_reduction::tracing;
use powder_reduction::writer::TextWriter;

/// Read the request and run the job.
async fn run(args: &cli::CommandLineArgs) -> Result<ReductionSummary, ReductionError> {
    let text = tokio::fs::read_to_string(&args.request).await?;
    let request = ReductionRequest::from_json(&text)?;
    let loader = Arc::new(FileLoader::new(&args.data_dir));
    reducer::run_job(
        request,
        loader,
        Arc::new(TextWriter),
        args.workers,
        args.use_rayon,
    )
    .await
}

/// Write the metrics file, if requested.
async fn write_metrics(args: &cli::CommandLineArgs) -> Result<(), ReductionError> {
    if let Some(path) = &args.metrics_file {
        tokio::fs::write(path, metrics::gather_metrics()?).await?;
    }
    Ok(())
}

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();
    let result = run(&args).await;
    if let Err(error) = write_metrics(&args).await {
        error.log();
    }
    match result {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{}", json),
                Err(error) => ReductionError::Io(error.into()).log(),
            }
            if summary.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(error) => {
            error.log();
            ExitCode::FAILURE
        }
    }
}
