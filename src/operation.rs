//! Collaborator interfaces of the reduction pipeline.
//!
//! The pipeline only relies on these traits. Reference implementations live in
//! [loader](crate::loader), [focus](crate::focus), [corrections](crate::corrections) and
//! [writer](crate::writer).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::characterization::CharacterizationTable;
use crate::chunking::{ChunkDescriptor, RunId};
use crate::error::ReductionError;
use crate::focus::FocusConfig;
use crate::models::OutputFormat;
use crate::splitter::TimeFilterWall;
use crate::types::{Dataset, RunInfo};

/// Source of raw run data.
///
/// # Methods
/// * `plan_chunks`: Split a run into chunks of bounded size.
/// * `load_chunk`: Load one chunk of a run.
/// * `load_metadata`: Load only the metadata of a run.
/// * `load_characterizations`: Load a characterization table.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Returns the chunks of a run, or an empty list if it should be read whole.
    ///
    /// # Arguments
    ///
    /// * `run`: Run to plan
    /// * `max_chunk_bytes`: Maximum chunk size in bytes, 0 for unbounded
    async fn plan_chunks(
        &self,
        run: &RunId,
        max_chunk_bytes: u64,
    ) -> Result<Vec<ChunkDescriptor>, ReductionError>;

    /// Load one chunk of a run.
    ///
    /// # Arguments
    ///
    /// * `run`: Run to load
    /// * `chunk`: Chunk to load
    /// * `wall`: Events outside the wall are not loaded
    async fn load_chunk(
        &self,
        run: &RunId,
        chunk: &ChunkDescriptor,
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError>;

    /// Load the metadata of a run without its events.
    async fn load_metadata(&self, run: &RunId) -> Result<RunInfo, ReductionError>;

    /// Load a characterization table.
    async fn load_characterizations(
        &self,
        path: &Path,
    ) -> Result<CharacterizationTable, ReductionError>;
}

/// Alignment and focusing of a raw dataset.
///
/// Implementations must be pure: the same dataset and configuration give the same result.
pub trait FocusOperation: Send + Sync {
    /// Focus a dataset.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Raw time of flight dataset
    /// * `config`: Focus configuration
    fn focus(&self, dataset: &Dataset, config: &FocusConfig) -> Result<Dataset, ReductionError>;
}

/// Corrections applied to vanadium and container datasets.
pub trait Corrections: Send + Sync {
    /// Annotate the sample material and apply an absorption correction.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Dataset to correct
    /// * `radius`: Cylinder radius in cm
    fn absorption(&self, dataset: Dataset, radius: f64) -> Result<Dataset, ReductionError>;

    /// Remove known vanadium Bragg peaks.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Focused dataset in d-spacing
    /// * `fwhm`: Peak width in bins
    /// * `tolerance`: Relative tolerance on peak positions
    fn strip_vanadium_peaks(
        &self,
        dataset: Dataset,
        fwhm: u32,
        tolerance: f64,
    ) -> Result<Dataset, ReductionError>;

    /// Smooth a dataset in the Fourier domain.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Dataset to smooth
    /// * `params`: Smoothing parameters, `"cutoff,order"`
    fn smooth(&self, dataset: Dataset, params: &str) -> Result<Dataset, ReductionError>;
}

/// Description of the files to write for one dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct SaveRequest {
    /// Output path without extension
    pub prefix: PathBuf,
    /// Formats to write
    pub formats: Vec<OutputFormat>,
    /// Whether the dataset is normalised
    pub normalized: bool,
    /// Output bank number
    pub bank: u32,
}

/// Serialisation of finished datasets.
pub trait OutputWriter: Send + Sync {
    /// Write a dataset in each requested format.
    ///
    /// Returns the paths written.
    fn save(&self, dataset: &Dataset, request: &SaveRequest)
        -> Result<Vec<PathBuf>, ReductionError>;
}
