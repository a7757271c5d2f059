//! Error handling.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{event, Level};

use crate::reducer::ReductionStage;

/// Powder reduction error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant maps to an [ErrorScope] that decides how far the failure propagates.
#[derive(Debug, Error)]
pub enum ReductionError {
    /// Binning parameters have the wrong cardinality or are all zero
    #[error("invalid binning specification: {reason}")]
    InvalidBinning { reason: String },

    /// Calibration file could not be interpreted
    #[error("invalid calibration file {path}: {reason}")]
    InvalidCalibration { path: PathBuf, reason: String },

    /// Characterization file could not be interpreted
    #[error("invalid characterization file {path}: {reason}")]
    InvalidCharacterizations { path: PathBuf, reason: String },

    /// Maximum chunk size could not be parsed
    #[error("invalid maximum chunk size")]
    InvalidChunkSize(#[from] byte_unit::ParseError),

    /// Fourier smoothing parameters could not be parsed
    #[error("invalid smoothing parameters \"{params}\"")]
    InvalidSmoothParams { params: String },

    /// Output directory does not exist
    #[error("output directory {path} does not exist")]
    OutputDirectoryMissing { path: PathBuf },

    /// A splitters table was supplied but the time filter wall was not derived from it
    #[error("a splitters table requires a non-degenerate time filter wall")]
    DegenerateFilterWall,

    /// The request combines splitting with an unsupported option
    #[error("unsupported split configuration: {reason}")]
    UnsupportedSplitConfiguration { reason: &'static str },

    /// Error deserialising the reduction request
    #[error("reduction request is not valid JSON")]
    RequestJson(#[from] serde_json::Error),

    /// Error validating the reduction request
    #[error("reduction request is not valid")]
    RequestValidation(#[from] validator::ValidationErrors),

    /// Summing runs measured at different frequencies
    #[error("cannot add incompatible frequencies ({left} != {right})")]
    IncompatibleFrequencies { left: f64, right: f64 },

    /// Summing runs measured at different wavelengths
    #[error("cannot add incompatible wavelengths ({left} != {right})")]
    IncompatibleWavelengths { left: f64, right: f64 },

    /// A chunk split into a different number of groups than the first chunk of the run
    #[error("run {run_number} chunk split into {found} groups, expected {expected}")]
    GroupCountMismatch {
        run_number: i64,
        expected: usize,
        found: usize,
    },

    /// A container or vanadium run list does not cover the sample index
    #[error("{kind} run list has {len} entries, no entry for sample index {index}")]
    RunListTooShort {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    /// Two datasets cannot be combined
    #[error("cannot {operation} datasets: {reason}")]
    IncompatibleDatasets {
        operation: &'static str,
        reason: String,
    },

    /// Workers entered a collective with inconsistent state
    #[error("collective operation failed: {reason}")]
    Collective { reason: String },

    /// Another worker failed while the workers were reducing the same run
    ///
    /// Carries the scope of the worker's own error, so that every worker stops at the same point.
    #[error("worker {rank} failed: {reason}")]
    PeerFailed {
        rank: usize,
        reason: String,
        scope: ErrorScope,
    },

    /// A worker task panicked or was cancelled
    #[error("worker task failed")]
    Join(#[from] tokio::task::JoinError),

    /// Raw data file does not exist
    #[error("data file {path} not found")]
    FileNotFound { path: PathBuf },

    /// Raw data file could not be parsed
    #[error("failed to parse data file {path}")]
    MalformedFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Generic I/O failure
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error creating an ndarray array from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ndarray::ShapeError),

    /// Error running the Fourier transform used for smoothing
    #[error("Fourier smoothing failed")]
    Fft(#[from] realfft::FftError),

    /// No worker contributed data for a run
    #[error("no data was accumulated for run {run_number}")]
    NoData { run_number: i64 },

    /// Dataset has no integrated proton charge
    #[error("dataset {name} has no proton charge to normalise by")]
    NoProtonCharge { name: String },

    /// Attempt to perform an operation on an empty dataset
    #[error("cannot perform {operation} on empty dataset {name}")]
    EmptyDataset {
        operation: &'static str,
        name: String,
    },

    /// Failure of one run's pipeline, with the step it happened in
    #[error("failed to reduce run {run_number} during {stage}")]
    Run {
        run_number: i64,
        stage: ReductionStage,
        #[source]
        source: Box<ReductionError>,
    },
}

/// How far a failure propagates, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorScope {
    /// Log and continue with a degraded value.
    Step,
    /// Abort the current run only; previously completed runs are kept.
    Run,
    /// Abort the whole job.
    Job,
}

impl ReductionError {
    /// Wrap an error with the run number and stage it happened in.
    pub fn in_run(self, run_number: i64, stage: ReductionStage) -> Self {
        match self {
            // Keep the innermost context.
            ReductionError::Run { .. } => self,
            _ => ReductionError::Run {
                run_number,
                stage,
                source: Box::new(self),
            },
        }
    }

    /// Returns the scope of the error.
    pub fn scope(&self) -> ErrorScope {
        match self {
            // Configuration errors
            ReductionError::InvalidBinning { .. }
            | ReductionError::InvalidCalibration { .. }
            | ReductionError::InvalidCharacterizations { .. }
            | ReductionError::InvalidChunkSize(_)
            | ReductionError::InvalidSmoothParams { .. }
            | ReductionError::OutputDirectoryMissing { .. }
            | ReductionError::DegenerateFilterWall
            | ReductionError::UnsupportedSplitConfiguration { .. }
            | ReductionError::RequestJson(_)
            | ReductionError::RequestValidation(_) => ErrorScope::Job,

            // Data consistency errors
            ReductionError::IncompatibleFrequencies { .. }
            | ReductionError::IncompatibleWavelengths { .. }
            | ReductionError::GroupCountMismatch { .. }
            | ReductionError::RunListTooShort { .. }
            | ReductionError::IncompatibleDatasets { .. }
            | ReductionError::Collective { .. }
            | ReductionError::Join(_) => ErrorScope::Job,

            // I/O and per-run failures
            ReductionError::FileNotFound { .. }
            | ReductionError::MalformedFile { .. }
            | ReductionError::Io(_)
            | ReductionError::ShapeInvalid(_)
            | ReductionError::Fft(_)
            | ReductionError::NoData { .. } => ErrorScope::Run,

            ReductionError::PeerFailed { scope, .. } => *scope,

            // Recoverable
            ReductionError::NoProtonCharge { .. } | ReductionError::EmptyDataset { .. } => {
                ErrorScope::Step
            }

            ReductionError::Run { source, .. } => source.scope(),
        }
    }

    /// Log the error and its chain of causes.
    ///
    /// Step-scoped errors are logged as warnings, everything else as errors.
    pub fn log(&self) {
        let report = ErrorReport::new(self);
        match self.scope() {
            ErrorScope::Step => {
                event!(Level::WARN, "{}", report.message);
                for cause in report.caused_by.iter().flatten() {
                    event!(Level::WARN, "Caused by: {}", cause);
                }
            }
            ErrorScope::Run | ErrorScope::Job => {
                event!(Level::ERROR, "{}", report.message);
                for cause in report.caused_by.iter().flatten() {
                    event!(Level::ERROR, "Caused by: {}", cause);
                }
            }
        }
    }
}

/// Flattened, serialisable description of an error
///
/// Used in the job summary to report failed runs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl ErrorReport {
    /// Return a new ErrorReport
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorReport { message, caused_by }
    }
}
