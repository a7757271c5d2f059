//! This crate reduces powder diffraction event data. Raw runs are read in bounded chunks,
//! optionally split into time groups, focused and accumulated, then combined with container
//! and vanadium reference runs and written out.
//!
//! Chunks of one run can be spread over several workers. Each worker focuses its share and the
//! partial results are summed identically on every worker before the reference corrections are
//! applied.
//!
//! The pipeline is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, drives loading and the worker
//!   tasks.
//! * [Serde](serde) performs (de)serialisation of JSON requests, run files and datasets.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays for histograms.
//! * [Rayon](rayon) runs the CPU-bound focusing and arithmetic in parallel.
//! * [realfft] performs the Fourier transforms used to smooth vanadium spectra.

pub mod accumulator;
pub mod characterization;
pub mod chunking;
pub mod cli;
pub mod context;
pub mod corrections;
pub mod error;
pub mod focus;
pub mod gather;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod operation;
pub mod operations;
pub mod pipeline;
pub mod reducer;
pub mod splitter;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod writer;
