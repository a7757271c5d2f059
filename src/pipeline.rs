//! Per-run chunk loop: load, split, focus and accumulate every chunk of a run.
//!
//! Three entry points mirror the ways a run is reduced:
//!
//! * [Pipeline::focus_chunks] focuses one run, chunk by chunk, possibly split into groups and
//!   distributed across workers.
//! * [Pipeline::focus_and_sum] focuses several runs and sums them.
//! * [Pipeline::load_and_sum] loads and sums several runs without focusing (vanadium).

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{event, Level};

use crate::accumulator::FocusAccumulator;
use crate::characterization::{
    check_info_match, CharacterizationInfo, CharacterizationMatcher, CharacterizationTable,
    RunOverrides,
};
use crate::chunking::{assign_round_robin, plan_chunks, ChunkDescriptor, RunId};
use crate::context::RunContext;
use crate::error::ReductionError;
use crate::focus::{Binning, Calibration, FocusConfig};
use crate::gather::{Contribution, Gatherer};
use crate::metrics;
use crate::models::{OutputFormat, ReductionRequest};
use crate::operation::{Corrections, FocusOperation, Loader, OutputWriter, SaveRequest};
use crate::operations::{self, Uncertainties};
use crate::splitter::{split_chunk, SplitGroup, SplitterTable, TimeFilterWall};
use crate::types::{Dataset, RunInfo};

/// Collaborators used by the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn Loader>,
    pub focus: Arc<dyn FocusOperation>,
    pub corrections: Arc<dyn Corrections>,
    pub writer: Arc<dyn OutputWriter>,
    pub gatherer: Arc<dyn Gatherer>,
    /// Run focus operations on the rayon thread pool
    pub use_rayon: bool,
}

/// Reduction pipeline of one worker.
///
/// Holds the job configuration and collaborators. Run-scoped state lives in a [RunContext]
/// passed to each call.
pub struct Pipeline {
    collaborators: Collaborators,
    request: Arc<ReductionRequest>,
    focus_config: Arc<FocusConfig>,
    vanadium_config: Arc<FocusConfig>,
    matcher: CharacterizationMatcher,
    max_chunk_bytes: u64,
    compress_tolerance: f64,
}

impl Pipeline {
    /// Return a new Pipeline.
    ///
    /// # Arguments
    ///
    /// * `request`: Reduction request
    /// * `collaborators`: Loader, focus, corrections, writer and gatherer
    /// * `calibration`: Parsed calibration
    /// * `table`: Optional characterization table
    pub fn new(
        request: Arc<ReductionRequest>,
        collaborators: Collaborators,
        calibration: Arc<Calibration>,
        table: Option<Arc<CharacterizationTable>>,
    ) -> Result<Self, ReductionError> {
        let max_chunk_bytes = request.max_chunk_bytes()?;
        let binning = Binning::new(&request.binning)?;
        let compress_tolerance = request.compress_tolerance();

        let preserve_events = if request.preserve_events && collaborators.gatherer.size() > 1 {
            event!(
                Level::WARN,
                "Event data is not preserved when reducing with {} workers",
                collaborators.gatherer.size()
            );
            false
        } else {
            request.preserve_events
        };

        let mut positions = table.as_ref().and_then(|table| table.positions.clone());
        if request.low_res_offset().is_some() {
            positions = positions.map(|positions| positions.duplicated_for_low_res());
        }

        let focus_config = FocusConfig {
            calibration,
            binning,
            wavelength_min: request.crop_wavelength_min,
            wavelength_max: request.crop_wavelength_max,
            prompt_pulse_width: request.remove_prompt_pulse_width,
            low_res_spectrum_offset: request.low_res_offset(),
            d_min: 0.0,
            d_max: 0.0,
            compress_tolerance,
            positions,
            preserve_events,
        };
        let vanadium_config = FocusConfig {
            preserve_events: false,
            ..focus_config.clone()
        };
        let overrides = RunOverrides {
            container: request.background_number.clone(),
            vanadium: request.vanadium_number.clone(),
            vanadium_background: request.vanadium_background_number.clone(),
        };
        let matcher = CharacterizationMatcher::new(
            table,
            overrides,
            request.frequency_log_names.clone(),
            request.wavelength_log_names.clone(),
        );
        Ok(Pipeline {
            collaborators,
            request,
            focus_config: Arc::new(focus_config),
            vanadium_config: Arc::new(vanadium_config),
            matcher,
            max_chunk_bytes,
            compress_tolerance,
        })
    }

    /// Return a new Pipeline, reading the calibration and characterization files.
    ///
    /// # Arguments
    ///
    /// * `request`: Reduction request
    /// * `collaborators`: Loader, focus, corrections, writer and gatherer
    pub async fn prepare(
        request: Arc<ReductionRequest>,
        collaborators: Collaborators,
    ) -> Result<Self, ReductionError> {
        let path = &request.calibration_file;
        let text = tokio::fs::read_to_string(path).await.map_err(|error| {
            ReductionError::InvalidCalibration {
                path: path.clone(),
                reason: error.to_string(),
            }
        })?;
        let calibration = Arc::new(Calibration::parse(path, &text)?);
        let table = match &request.characterization_file {
            Some(path) => Some(Arc::new(
                collaborators.loader.load_characterizations(path).await?,
            )),
            None => None,
        };
        Self::new(request.clone(), collaborators, calibration, table)
    }

    /// The reduction request.
    pub fn request(&self) -> &ReductionRequest {
        &self.request
    }

    /// The gatherer of this worker.
    pub fn gatherer(&self) -> &dyn Gatherer {
        self.collaborators.gatherer.as_ref()
    }

    /// The corrections collaborator.
    pub fn corrections(&self) -> &dyn Corrections {
        self.collaborators.corrections.as_ref()
    }

    /// Event compression tolerance.
    pub fn compress_tolerance(&self) -> f64 {
        self.compress_tolerance
    }

    /// Identifier of a run of this job's instrument.
    pub fn run_id(&self, run_number: i64) -> RunId {
        RunId::new(
            &self.request.instrument,
            run_number,
            &self.request.extension,
        )
    }

    /// Resolve the characterization of a run, loading its metadata the first time.
    pub async fn characterize(
        &self,
        context: &mut RunContext,
        run_number: i64,
    ) -> Result<Arc<CharacterizationInfo>, ReductionError> {
        if let Some(info) = context.cached_characterization(run_number) {
            return Ok(info);
        }
        let metadata = if run_number > 0 {
            self.collaborators
                .loader
                .load_metadata(&self.run_id(run_number))
                .await?
        } else {
            RunInfo::new(run_number, 0)
        };
        Ok(context.characterize(&self.matcher, &metadata))
    }

    /// Time filter wall of a sample run.
    ///
    /// With a splitters table the wall spans the table, relative to the run start.
    pub async fn sample_wall(
        &self,
        run_number: i64,
        splitters: Option<&SplitterTable>,
    ) -> Result<TimeFilterWall, ReductionError> {
        let Some(table) = splitters else {
            return Ok(TimeFilterWall::NONE);
        };
        let metadata = self
            .collaborators
            .loader
            .load_metadata(&self.run_id(run_number))
            .await?;
        let wall = TimeFilterWall::from_table(table, metadata.start_time_ns);
        event!(
            Level::INFO,
            "Run {} time filter wall: {} s to {} s",
            run_number,
            wall.start_seconds,
            wall.stop_seconds
        );
        Ok(wall)
    }

    /// Focus configuration of a run, cropped to its characterization's d-spacing range.
    fn run_config(
        &self,
        config: &Arc<FocusConfig>,
        info: &CharacterizationInfo,
    ) -> Arc<FocusConfig> {
        if info.d_min > 0.0 || info.d_max > 0.0 {
            Arc::new(config.with_d_range(info.d_min, info.d_max))
        } else {
            config.clone()
        }
    }

    /// Load one chunk and drop bad pulses.
    async fn load(
        &self,
        run: &RunId,
        chunk: &ChunkDescriptor,
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        let dataset = self
            .collaborators
            .loader
            .load_chunk(run, chunk, wall)
            .await?;
        let mut dataset = dataset.renamed(&format!("{}{}", run.name(), chunk));
        metrics::CHUNKS_PROCESSED.inc();
        metrics::EVENTS_LOADED.inc_by(dataset.number_events().unwrap_or(0) as u64);
        if self.request.filter_bad_pulses > 0.0 {
            operations::filter_bad_pulses(&mut dataset, self.request.filter_bad_pulses);
        }
        Ok(dataset)
    }

    /// Apply a focus operation, on the rayon pool if configured.
    async fn focus(
        &self,
        dataset: Dataset,
        config: &Arc<FocusConfig>,
    ) -> Result<Dataset, ReductionError> {
        if self.collaborators.use_rayon {
            let focus = self.collaborators.focus.clone();
            let config = config.clone();
            tokio_rayon::spawn(move || focus.focus(&dataset, &config)).await
        } else {
            self.collaborators.focus.focus(&dataset, config)
        }
    }

    /// Focus the groups of one chunk.
    async fn focus_groups(
        &self,
        groups: Vec<SplitGroup>,
        config: &Arc<FocusConfig>,
    ) -> Result<Vec<SplitGroup>, ReductionError> {
        let mut focused = Vec::with_capacity(groups.len());
        for split in groups {
            let dataset = self.focus(split.dataset, config).await?;
            focused.push(SplitGroup {
                group: split.group,
                dataset,
            });
        }
        Ok(focused)
    }

    /// Accumulate this worker's chunks of a run.
    async fn accumulate_chunks(
        &self,
        run: &RunId,
        chunks: Vec<(usize, ChunkDescriptor)>,
        total: usize,
        wall: TimeFilterWall,
        splitters: Option<&SplitterTable>,
        config: &Arc<FocusConfig>,
    ) -> Result<Option<Vec<Dataset>>, ReductionError> {
        let mut accumulator =
            FocusAccumulator::new(&self.request.instrument, run.number, self.compress_tolerance);
        for (index, chunk) in chunks {
            event!(
                Level::INFO,
                "Processing chunk {} of {} of {}",
                index + 1,
                total,
                run
            );
            let dataset = self.load(run, &chunk, wall).await?;
            let groups = split_chunk(
                dataset,
                splitters,
                self.request.split_information.as_ref(),
                wall,
                &self.request.instrument,
            )?;
            let focused = self.focus_groups(groups, config).await?;
            accumulator.accumulate(focused)?;
        }
        Ok(accumulator.finalize())
    }

    /// Normalise by current, leaving the dataset as it is on failure.
    fn normalise(&self, dataset: &mut Dataset) {
        if let Err(error) = operations::normalise_by_current(dataset) {
            error.log();
        }
    }

    /// Focus one run, chunk by chunk.
    ///
    /// Chunks are shared round-robin between workers and the per-worker results are gathered.
    /// Returns one dataset per output group. Bin edges that depend on the data are set once the
    /// whole run has been gathered.
    ///
    /// # Arguments
    ///
    /// * `context`: Run-scoped context
    /// * `run_number`: Run to focus
    /// * `wall`: Time filter wall applied when loading
    /// * `splitters`: Optional splitters table
    /// * `normalise`: Normalise each group by current
    #[tracing::instrument(level = "DEBUG", skip(self, context, splitters))]
    pub async fn focus_chunks(
        &self,
        context: &mut RunContext,
        run_number: i64,
        wall: TimeFilterWall,
        splitters: Option<&SplitterTable>,
        normalise: bool,
    ) -> Result<Vec<Dataset>, ReductionError> {
        let run = self.run_id(run_number);
        let gatherer = self.gatherer();

        // Every worker must reach the gather, even when its own chunks failed.
        let local = match self.characterize(context, run_number).await {
            Ok(info) => {
                let config = self.run_config(&self.focus_config, &info);
                match plan_chunks(self.collaborators.loader.as_ref(), &run, self.max_chunk_bytes)
                    .await
                {
                    Ok(plan) => {
                        let total = plan.len();
                        let mine = assign_round_robin(plan, gatherer.rank(), gatherer.size());
                        self.accumulate_chunks(&run, mine, total, wall, splitters, &config)
                            .await
                            .map(|groups| (info, config, groups))
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };
        let (contribution, local) = match local {
            Ok((info, config, Some(groups))) => (Contribution::Data(groups), Ok((info, config))),
            Ok((info, config, None)) => (Contribution::Nothing, Ok((info, config))),
            Err(error) => (Contribution::failed(&error), Err(error)),
        };
        let gathered = gatherer.gather(contribution).await;
        // Every worker leaves with the scope of the most severe failure.
        let ((info, config), groups) = match (local, gathered) {
            (Err(error), Err(peer)) if peer.scope() > error.scope() => return Err(peer),
            (Err(error), _) | (Ok(_), Err(error)) => return Err(error),
            (Ok(local), Ok(groups)) => (local, groups),
        };
        let groups = groups.ok_or(ReductionError::NoData { run_number })?;

        let mut finished = Vec::with_capacity(groups.len());
        for mut dataset in groups {
            operations::compress(&mut dataset, self.compress_tolerance);
            if config.bins_from_data() {
                config.set_edges(&mut dataset)?;
                if !config.preserve_events {
                    dataset = operations::convert_to_histogram(dataset)?;
                }
            }
            if self.max_chunk_bytes > 0 {
                let charge = dataset.run.integrated_proton_charge();
                dataset.run.set_property("proton_charge", charge);
            }
            if let Some(iparm_file) = &info.iparm_file {
                dataset.run.set_property("iparm_file", iparm_file.as_str());
            }
            if normalise {
                self.normalise(&mut dataset);
            }
            if self.request.save_as.contains(&OutputFormat::Pdfgetn) && gatherer.is_leader() {
                self.save_pdfgetn(context, &dataset, info.bank)?;
            }
            finished.push(dataset);
        }
        event!(
            Level::INFO,
            "Focused {} into {} group(s)",
            run,
            finished.len()
        );
        Ok(finished)
    }

    /// Focus several runs and sum them.
    ///
    /// Runs must have compatible frequency and wavelength. The sum is normalised by current once,
    /// after summing.
    ///
    /// # Arguments
    ///
    /// * `context`: Run-scoped context
    /// * `run_numbers`: Runs to sum
    /// * `wall`: Time filter wall applied when loading
    #[tracing::instrument(level = "DEBUG", skip(self, context))]
    pub async fn focus_and_sum(
        &self,
        context: &mut RunContext,
        run_numbers: &[i64],
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        let mut sum: Option<(Arc<CharacterizationInfo>, Dataset)> = None;
        for &run_number in run_numbers {
            let focused = self
                .focus_chunks(context, run_number, wall, None, false)
                .await?;
            let dataset = focused
                .into_iter()
                .next()
                .ok_or(ReductionError::NoData { run_number })?;
            let info = self.characterize(context, run_number).await?;
            sum = Some(match sum {
                None => (info, dataset),
                Some((first, total)) => {
                    check_info_match(&first, &info)?;
                    let mut total = operations::add(total, dataset)?;
                    operations::compress(&mut total, self.compress_tolerance);
                    (first, total)
                }
            });
        }
        let (_, mut total) = sum.ok_or(ReductionError::NoData {
            run_number: run_numbers.first().copied().unwrap_or_default(),
        })?;
        if self.request.normalize_by_current {
            self.normalise(&mut total);
        }
        Ok(total)
    }

    /// Load every chunk of a run without focusing, compressing after each merge.
    async fn load_whole(
        &self,
        run: &RunId,
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        let chunks =
            plan_chunks(self.collaborators.loader.as_ref(), run, self.max_chunk_bytes).await?;
        let mut total: Option<Dataset> = None;
        for chunk in &chunks {
            let mut dataset = self.load(run, chunk, wall).await?;
            operations::compress(&mut dataset, self.compress_tolerance);
            total = Some(match total {
                None => dataset,
                Some(total) => {
                    let mut total = operations::add(total, dataset)?;
                    operations::compress(&mut total, self.compress_tolerance);
                    total
                }
            });
        }
        total
            .map(|dataset| dataset.renamed(&run.name()))
            .ok_or(ReductionError::NoData {
                run_number: run.number,
            })
    }

    /// Load several runs and sum them, without focusing.
    ///
    /// Every worker loads all chunks itself. The sum is normalised by current when requested.
    ///
    /// # Arguments
    ///
    /// * `context`: Run-scoped context
    /// * `run_numbers`: Runs to sum
    /// * `wall`: Time filter wall applied when loading
    #[tracing::instrument(level = "DEBUG", skip(self, context))]
    pub async fn load_and_sum(
        &self,
        context: &mut RunContext,
        run_numbers: &[i64],
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        let mut sum: Option<(Arc<CharacterizationInfo>, Dataset)> = None;
        for &run_number in run_numbers {
            let run = self.run_id(run_number);
            let info = self.characterize(context, run_number).await?;
            let dataset = self.load_whole(&run, wall).await?;
            sum = Some(match sum {
                None => (info, dataset),
                Some((first, total)) => {
                    check_info_match(&first, &info)?;
                    let mut total = operations::add(total, dataset)?;
                    operations::compress(&mut total, self.compress_tolerance);
                    (first, total)
                }
            });
        }
        let (_, mut total) = sum.ok_or(ReductionError::NoData {
            run_number: run_numbers.first().copied().unwrap_or_default(),
        })?;
        if self.request.normalize_by_current {
            self.normalise(&mut total);
        }
        Ok(total)
    }

    /// Focus a whole vanadium dataset into a histogram.
    ///
    /// # Arguments
    ///
    /// * `dataset`: Vanadium, loaded whole
    /// * `info`: Characterization of the sample the vanadium applies to
    pub async fn focus_vanadium(
        &self,
        dataset: Dataset,
        info: &CharacterizationInfo,
    ) -> Result<Dataset, ReductionError> {
        let config = self.run_config(&self.vanadium_config, info);
        let focused = self.focus(dataset, &config).await?;
        operations::convert_to_histogram(focused)
    }

    /// Output path of a dataset, without extension.
    fn output_prefix(&self, dataset: &Dataset) -> PathBuf {
        let file_name = format!("{}{}", self.request.output_file_prefix, dataset.name);
        self.request.output_directory.join(file_name)
    }

    /// Write a dataset in the requested formats, except PDFgetN.
    ///
    /// # Arguments
    ///
    /// * `context`: Run-scoped context, records the files written
    /// * `dataset`: Dataset to write
    /// * `normalized`: Whether the dataset is vanadium normalised
    /// * `bank`: Output bank number
    pub fn save(
        &self,
        context: &mut RunContext,
        dataset: &Dataset,
        normalized: bool,
        bank: u32,
    ) -> Result<(), ReductionError> {
        let formats: Vec<OutputFormat> = self
            .request
            .save_as
            .iter()
            .copied()
            .filter(|format| *format != OutputFormat::Pdfgetn)
            .collect();
        if formats.is_empty() {
            return Ok(());
        }
        let request = SaveRequest {
            prefix: self.output_prefix(dataset),
            formats,
            normalized,
            bank,
        };
        let paths = self.collaborators.writer.save(dataset, &request)?;
        event!(Level::INFO, "Saved {} to {:?}", dataset.name, paths);
        context.record_saved(paths);
        Ok(())
    }

    /// Write a focused dataset in PDFgetN form, with counting-statistics uncertainties.
    fn save_pdfgetn(
        &self,
        context: &mut RunContext,
        dataset: &Dataset,
        bank: u32,
    ) -> Result<(), ReductionError> {
        let mut pdf = operations::convert_to_histogram(dataset.clone())?;
        operations::set_uncertainties(&mut pdf, Uncertainties::Sqrt);
        let request = SaveRequest {
            prefix: self.output_prefix(dataset),
            formats: vec![OutputFormat::Pdfgetn],
            normalized: false,
            bank,
        };
        let paths = self.collaborators.writer.save(&pdf, &request)?;
        context.record_saved(paths);
        Ok(())
    }
}
