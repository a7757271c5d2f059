//! Run combination: drives the reduction of each sample run and combines it with its container
//! and vanadium.
//!
//! Each sample moves through the stages of [ReductionStage]. Run-scoped failures are recorded in
//! the [ReductionSummary] and the job continues with the next sample; job-scoped failures abort.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use strum_macros::Display;
use tokio::task::JoinSet;
use tracing::{event, Instrument, Level};

use crate::characterization::{no_run_specified, CharacterizationInfo};
use crate::context::RunContext;
use crate::corrections::ReferenceCorrections;
use crate::error::{ErrorReport, ErrorScope, ReductionError};
use crate::focus::DiffractionFocus;
use crate::gather::{Gatherer, LocalCluster, SingleProcess};
use crate::metrics;
use crate::models::ReductionRequest;
use crate::operation::{Loader, OutputWriter};
use crate::operations;
use crate::pipeline::{Collaborators, Pipeline};
use crate::splitter::TimeFilterWall;
use crate::types::Dataset;

/// Stage of the reduction of one sample.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ReductionStage {
    Idle,
    Summing,
    PerRunReducing,
    ContainerResolving,
    VanadiumResolving,
    Combining,
    Normalizing,
    Saved,
}

/// A sample run that failed to reduce.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailedRun {
    pub run_number: i64,
    pub error: ErrorReport,
}

/// Outcome of a reduction job.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReductionSummary {
    /// Files written
    pub saved: Vec<PathBuf>,
    /// Sample runs that produced no output
    pub failed: Vec<FailedRun>,
}

/// Check the parts of a request that only make sense together.
pub fn check_split_configuration(request: &ReductionRequest) -> Result<(), ReductionError> {
    if request.splitters.is_none() {
        return Ok(());
    }
    if request.sum {
        return Err(ReductionError::UnsupportedSplitConfiguration {
            reason: "summing and splitting cannot be combined",
        });
    }
    if request.run_number.len() > 1 {
        return Err(ReductionError::UnsupportedSplitConfiguration {
            reason: "splitting requires a single sample run",
        });
    }
    Ok(())
}

/// Pick the run applying to the sample at `index`.
///
/// A single entry applies to every sample.
fn select_run(kind: &'static str, runs: &[i64], index: usize) -> Result<i64, ReductionError> {
    match runs {
        [run] => Ok(*run),
        _ => runs
            .get(index)
            .copied()
            .ok_or(ReductionError::RunListTooShort {
                kind,
                index,
                len: runs.len(),
            }),
    }
}

/// Drives the reduction of every sample run of a job on one worker.
pub struct RunCombiner {
    pipeline: Pipeline,
    context: RunContext,
    stage: ReductionStage,
    stage_started: Instant,
    summary: ReductionSummary,
}

impl RunCombiner {
    /// Return a new RunCombiner.
    pub fn new(pipeline: Pipeline) -> Self {
        RunCombiner {
            pipeline,
            context: RunContext::new(),
            stage: ReductionStage::Idle,
            stage_started: Instant::now(),
            summary: ReductionSummary::default(),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> ReductionStage {
        self.stage
    }

    fn enter(&mut self, stage: ReductionStage) {
        metrics::observe_stage(&self.stage.to_string(), self.stage_started.elapsed());
        event!(Level::DEBUG, "{} -> {}", self.stage, stage);
        self.stage = stage;
        self.stage_started = Instant::now();
    }

    /// Wall used for container and vanadium runs.
    fn characterization_wall(&self, sample_wall: TimeFilterWall) -> TimeFilterWall {
        if self.pipeline.request().filter_characterizations {
            sample_wall
        } else {
            TimeFilterWall::NONE
        }
    }

    /// Reduce every sample of the job.
    ///
    /// Returns the files written and the runs that failed.
    pub async fn run(mut self) -> Result<ReductionSummary, ReductionError> {
        check_split_configuration(self.pipeline.request())?;
        let request = self.pipeline.request().clone();

        if request.sum {
            let runs: Vec<i64> = request
                .run_number
                .iter()
                .copied()
                .filter(|run| *run > 0)
                .collect();
            let first = runs.first().copied().unwrap_or_default();
            let result = self.reduce_summed(first, &runs).await;
            self.record(first, result)?;
        } else {
            let mut index = 0;
            for &run_number in &request.run_number {
                let result = self.reduce_run(run_number, &mut index).await;
                self.record(run_number, result)?;
            }
        }
        self.enter(ReductionStage::Idle);
        self.summary.saved = self.context.saved().to_vec();
        Ok(self.summary)
    }

    /// Apply the batch error policy to the result of one sample run.
    fn record(&mut self, run_number: i64, result: Result<(), ReductionError>) -> Result<(), ReductionError> {
        let Err(error) = result else {
            return Ok(());
        };
        let error = error.in_run(run_number, self.stage);
        if error.scope() == ErrorScope::Job {
            return Err(error);
        }
        error.log();
        metrics::RUN_FAILURES
            .with_label_values(&[&self.stage.to_string()])
            .inc();
        self.summary.failed.push(FailedRun {
            run_number,
            error: ErrorReport::new(&error),
        });
        self.enter(ReductionStage::Idle);
        Ok(())
    }

    /// Sum the sample runs, then reduce the sum.
    async fn reduce_summed(&mut self, first: i64, runs: &[i64]) -> Result<(), ReductionError> {
        self.enter(ReductionStage::Summing);
        let sample = self
            .pipeline
            .focus_and_sum(&mut self.context, runs, TimeFilterWall::NONE)
            .await?;
        let info = self.pipeline.characterize(&mut self.context, first).await?;
        self.reduce_sample(0, Some(sample), &info, TimeFilterWall::NONE)
            .await
    }

    /// Focus one sample run, possibly split into groups, then reduce each group.
    ///
    /// `index` is the position of the next sample and advances by one per group.
    #[tracing::instrument(level = "INFO", skip(self, index))]
    async fn reduce_run(&mut self, run_number: i64, index: &mut usize) -> Result<(), ReductionError> {
        if run_number <= 0 {
            // Only the characterization runs are reduced.
            let info = self
                .pipeline
                .characterize(&mut self.context, run_number)
                .await?;
            self.reduce_sample(*index, None, &info, TimeFilterWall::NONE)
                .await?;
            *index += 1;
            return Ok(());
        }

        self.enter(ReductionStage::PerRunReducing);
        let info = self
            .pipeline
            .characterize(&mut self.context, run_number)
            .await?;
        let splitters = self.pipeline.request().splitters.clone();
        let wall = self
            .pipeline
            .sample_wall(run_number, splitters.as_ref())
            .await?;
        let normalise = self.pipeline.request().normalize_by_current;
        let groups = self
            .pipeline
            .focus_chunks(
                &mut self.context,
                run_number,
                wall,
                splitters.as_ref(),
                normalise,
            )
            .await?;
        for sample in groups {
            event!(
                Level::INFO,
                "Sample {}: {} events",
                sample.name,
                sample
                    .number_events()
                    .map_or("histogram".to_string(), |n| n.to_string())
            );
            self.reduce_sample(*index, Some(sample), &info, wall).await?;
            *index += 1;
        }
        Ok(())
    }

    /// Resolve container and vanadium, then combine, normalise and save one sample.
    ///
    /// # Arguments
    ///
    /// * `index`: Position of the sample, selects container and vanadium runs
    /// * `sample`: Focused sample, or None to only reduce the characterization runs
    /// * `info`: Characterization of the sample
    /// * `wall`: Time filter wall of the sample
    #[tracing::instrument(level = "DEBUG", skip(self, sample, info, wall))]
    async fn reduce_sample(
        &mut self,
        index: usize,
        sample: Option<Dataset>,
        info: &CharacterizationInfo,
        wall: TimeFilterWall,
    ) -> Result<(), ReductionError> {
        let wall = self.characterization_wall(wall);

        self.enter(ReductionStage::ContainerResolving);
        let container = self.resolve_container(index, info, wall).await?;
        self.enter(ReductionStage::VanadiumResolving);
        let vanadium = self.resolve_vanadium(index, info, wall).await?;

        let Some(sample) = sample else {
            return Ok(());
        };
        self.enter(ReductionStage::Combining);
        let (sample, normalized) = self.combine(sample, container, vanadium)?;
        if !self.pipeline.gatherer().is_leader() {
            return Ok(());
        }

        self.enter(ReductionStage::Normalizing);
        let policy = self.pipeline.request().push_data_positive;
        let mut sample = operations::reset_negatives(sample, policy)?;

        self.enter(ReductionStage::Saved);
        let scale = self.pipeline.request().scale_data;
        if scale != 1.0 {
            operations::scale(&mut sample, scale);
        }
        self.pipeline
            .save(&mut self.context, &sample, normalized, info.bank)?;
        metrics::RUNS_REDUCED.inc();
        Ok(())
    }

    /// Subtract the container and divide by the vanadium.
    ///
    /// Returns the sample and whether it is vanadium normalised.
    fn combine(
        &self,
        sample: Dataset,
        container: Option<Dataset>,
        vanadium: Option<Dataset>,
    ) -> Result<(Dataset, bool), ReductionError> {
        let tolerance = self.pipeline.compress_tolerance();
        let mut sample = sample;
        if let Some(container) = container {
            // A histogram container needs a histogram sample, never the other way round.
            if !container.is_event() && sample.is_event() {
                sample = operations::convert_to_histogram(sample)?;
            }
            event!(Level::INFO, "Subtracting {} from {}", container.name, sample.name);
            sample = operations::subtract(sample, container)?;
            operations::compress(&mut sample, tolerance);
        }
        let normalized = match vanadium {
            Some(vanadium) => {
                event!(Level::INFO, "Dividing {} by {}", sample.name, vanadium.name);
                let van_number = vanadium.run.run_number;
                sample = operations::divide(sample, vanadium)?;
                sample.run.set_property("van_number", van_number);
                true
            }
            None => false,
        };
        operations::compress(&mut sample, tolerance);
        Ok((sample, normalized))
    }

    /// Focus the container of a sample, or reuse it from the session.
    async fn resolve_container(
        &mut self,
        index: usize,
        info: &CharacterizationInfo,
        wall: TimeFilterWall,
    ) -> Result<Option<Dataset>, ReductionError> {
        let runs = &info.container;
        if no_run_specified(runs) {
            return Ok(None);
        }
        let run_number = select_run("container", runs, index)?;
        let name = self.pipeline.run_id(run_number).name();
        if let Some(container) = self.context.reduced(&name) {
            return Ok(Some(container.clone()));
        }

        let request = self.pipeline.request().clone();
        let mut container = if request.sum {
            self.pipeline
                .focus_and_sum(&mut self.context, runs, wall)
                .await?
        } else {
            self.pipeline
                .focus_chunks(
                    &mut self.context,
                    run_number,
                    wall,
                    None,
                    request.normalize_by_current,
                )
                .await?
                .into_iter()
                .next()
                .ok_or(ReductionError::NoData { run_number })?
        };
        if !request.background_smooth_params.is_empty() {
            container = self
                .pipeline
                .corrections()
                .smooth(container, &request.background_smooth_params)?;
        }
        let container = container.renamed(&name);
        self.context.store(container.clone());
        Ok(Some(container))
    }

    /// Load, correct and focus the vanadium of a sample, or reuse it from the session.
    async fn resolve_vanadium(
        &mut self,
        index: usize,
        info: &CharacterizationInfo,
        wall: TimeFilterWall,
    ) -> Result<Option<Dataset>, ReductionError> {
        let runs = &info.vanadium;
        if no_run_specified(runs) {
            return Ok(None);
        }
        let run_number = select_run("vanadium", runs, index)?;
        let name = self.pipeline.run_id(run_number).name();
        if let Some(vanadium) = self.context.reduced(&name) {
            return Ok(Some(vanadium.clone()));
        }

        let request = self.pipeline.request().clone();
        let to_load = if request.sum {
            runs.clone()
        } else {
            vec![run_number]
        };
        let mut vanadium = self
            .pipeline
            .load_and_sum(&mut self.context, &to_load, wall)
            .await?;

        let backgrounds = &info.vanadium_background;
        if !no_run_specified(backgrounds) {
            let to_load = if request.sum {
                backgrounds.clone()
            } else {
                vec![select_run("vanadium background", backgrounds, index)?]
            };
            let background = self
                .pipeline
                .load_and_sum(&mut self.context, &to_load, wall)
                .await?;
            if background.number_events() == Some(0) {
                event!(Level::INFO, "Vanadium background {} is empty", background.name);
            } else {
                vanadium = operations::subtract(vanadium, background)?;
            }
        }
        operations::compress(&mut vanadium, self.pipeline.compress_tolerance());

        let corrections = self.pipeline.corrections();
        vanadium = corrections.absorption(vanadium, request.vanadium_radius)?;
        vanadium = self.pipeline.focus_vanadium(vanadium, info).await?;
        if request.strip_vanadium_peaks {
            vanadium = corrections.strip_vanadium_peaks(
                vanadium,
                request.vanadium_fwhm,
                request.vanadium_peak_tol,
            )?;
        } else {
            event!(Level::INFO, "Not stripping vanadium peaks");
        }
        vanadium = corrections.smooth(vanadium, &request.vanadium_smooth_params)?;
        operations::set_uncertainties(&mut vanadium, operations::Uncertainties::Zero);

        let vanadium = vanadium.renamed(&name);
        self.context.store(vanadium.clone());
        Ok(Some(vanadium))
    }
}

/// Run a reduction job.
///
/// With more than one worker, an in-process cluster shares the chunks of each run. The summary
/// of the leader is returned. The first worker to fail aborts the others, so none is left waiting
/// in a collective.
///
/// # Arguments
///
/// * `request`: Reduction request
/// * `loader`: Source of run data
/// * `writer`: Output writer
/// * `workers`: Number of workers
/// * `use_rayon`: Run focus operations on the rayon pool
pub async fn run_job(
    mut request: ReductionRequest,
    loader: Arc<dyn Loader>,
    writer: Arc<dyn OutputWriter>,
    workers: usize,
    use_rayon: bool,
) -> Result<ReductionSummary, ReductionError> {
    request.expand_paths();
    request.check_output_directory()?;
    check_split_configuration(&request)?;
    let request = Arc::new(request);

    let gatherers: Vec<Arc<dyn Gatherer>> = if workers <= 1 {
        vec![Arc::new(SingleProcess)]
    } else {
        LocalCluster::new(workers)
            .into_iter()
            .map(|worker| Arc::new(worker) as Arc<dyn Gatherer>)
            .collect()
    };
    event!(Level::INFO, "Reducing with {} worker(s)", gatherers.len());

    let mut workers = JoinSet::new();
    for gatherer in gatherers {
        let rank = gatherer.rank();
        let collaborators = Collaborators {
            loader: loader.clone(),
            focus: Arc::new(DiffractionFocus::new(request.frequency_log_names.clone())),
            corrections: Arc::new(ReferenceCorrections),
            writer: writer.clone(),
            gatherer,
            use_rayon,
        };
        let request = request.clone();
        let span = tracing::info_span!("worker", rank);
        workers.spawn(
            async move {
                let pipeline = Pipeline::prepare(request, collaborators).await?;
                let summary = RunCombiner::new(pipeline).run().await?;
                Ok::<_, ReductionError>((rank, summary))
            }
            .instrument(span),
        );
    }

    let mut summary = None;
    while let Some(result) = workers.join_next().await {
        // Returning early drops the set, which aborts the remaining workers.
        let (rank, result) = result??;
        if rank == 0 {
            summary = Some(result);
        }
    }
    Ok(summary.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::RunId;
    use crate::models::OutputFormat;
    use crate::test_utils::{self, MemoryLoader, RecordingWriter};
    use crate::types::{DatasetData, PropertyValue};

    struct Job {
        loader: Arc<MemoryLoader>,
        writer: Arc<RecordingWriter>,
        directory: tempfile::TempDir,
    }

    impl Job {
        fn new() -> Self {
            Job {
                loader: Arc::new(MemoryLoader::new().with_chunks(2)),
                writer: Arc::new(RecordingWriter::new()),
                directory: tempfile::tempdir().unwrap(),
            }
        }

        fn insert(&self, run_number: i64, dataset: Dataset) {
            self.loader
                .insert(&RunId::new("PG3", run_number, "_event.json"), dataset);
        }

        /// Request with the calibration and output directory filled in.
        fn request(&self, extra: &str) -> ReductionRequest {
            let calibration = test_utils::write_calibration(self.directory.path());
            let json = format!(
                r#"{{
                    "calibration_file": "{}",
                    "output_directory": "{}",
                    "max_chunk_size": "1 KB",
                    {}
                }}"#,
                calibration.display(),
                self.directory.path().display(),
                extra
            );
            ReductionRequest::from_json(&json).unwrap()
        }

        async fn run(&self, extra: &str, workers: usize) -> Result<ReductionSummary, ReductionError> {
            run_job(
                self.request(extra),
                self.loader.clone(),
                self.writer.clone(),
                workers,
                false,
            )
            .await
        }
    }

    #[test]
    fn test_stage_names() {
        assert_eq!("PerRunReducing", ReductionStage::PerRunReducing.to_string());
        assert_eq!("Saved", ReductionStage::Saved.to_string());
    }

    #[test]
    fn test_select_run() {
        assert_eq!(5, select_run("container", &[5], 3).unwrap());
        assert_eq!(6, select_run("container", &[5, 6], 1).unwrap());
        let error = select_run("vanadium", &[5, 6], 2).unwrap_err();
        assert_eq!(
            "vanadium run list has 2 entries, no entry for sample index 2",
            error.to_string()
        );
    }

    #[test]
    fn test_split_configuration() {
        let mut request = test_utils::get_test_request();
        assert!(check_split_configuration(&request).is_ok());
        request.splitters = Some(crate::splitter::SplitterTable::new(vec![(0, 10, 0).into()]));
        assert!(check_split_configuration(&request).is_ok());
        request.sum = true;
        assert!(matches!(
            check_split_configuration(&request),
            Err(ReductionError::UnsupportedSplitConfiguration { .. })
        ));
        request.sum = false;
        request.run_number = vec![1, 2];
        assert!(matches!(
            check_split_configuration(&request),
            Err(ReductionError::UnsupportedSplitConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 200, 1));
        job.insert(2000, test_utils::random_events(2000, 2, 400, 2));
        let summary = job
            .run(
                r#""run_number": [1000],
                "vanadium_number": [2000],
                "binning": [0.01, -0.02, 3.0],
                "push_data_positive": "reset-to-zero",
                "save_as": ["gsas", "topas"]"#,
                1,
            )
            .await
            .unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(2, summary.saved.len());

        let saved = job.writer.saved();
        assert_eq!(1, saved.len());
        let (dataset, request) = &saved[0];
        assert_eq!("PG3_1000", dataset.name);
        assert!(request.normalized);
        assert_eq!(vec![OutputFormat::Gsas, OutputFormat::Topas], request.formats);
        assert_eq!(Some(&PropertyValue::Int(2000)), dataset.run.property("van_number"));
        let DatasetData::Histogram(histogram) = &dataset.data else {
            panic!("expected histogram output");
        };
        assert!(histogram.counts.iter().all(|count| *count >= 0.0));
        assert!(histogram.counts.iter().any(|count| *count > 0.0));
    }

    #[tokio::test]
    async fn test_end_to_end_with_splitting() {
        let job = Job::new();
        job.insert(3000, test_utils::timed_run(3000, &[1, 20, 49, 50, 70, 119, 125]));
        let summary = job
            .run(
                r#""run_number": [3000],
                "vanadium_number": [-1],
                "binning": [0.5, 0.5, 3.0],
                "filter_bad_pulses": 0,
                "splitters": [[0, 50000000000, 0], [50000000000, 120000000000, 1]]"#,
                1,
            )
            .await
            .unwrap();
        assert!(summary.failed.is_empty());

        let saved = job.writer.saved();
        assert_eq!(2, saved.len());
        let bounds = [(0, 50_000_000_000), (50_000_000_000, 120_000_000_000)];
        for ((dataset, request), (start, stop)) in saved.iter().zip(bounds) {
            assert!(!request.normalized);
            let DatasetData::Events(events) = &dataset.data else {
                panic!("expected event output");
            };
            let pulses: Vec<i64> = events
                .spectra
                .iter()
                .flat_map(|spectrum| spectrum.events.iter().map(|event| event.pulse_time_ns))
                .collect();
            assert!(!pulses.is_empty());
            assert!(pulses.iter().all(|pulse| *pulse >= start && *pulse < stop));
            assert!(dataset
                .run
                .proton_charge
                .keys()
                .all(|pulse| *pulse >= start && *pulse < stop));
        }
        assert_eq!("PG3_3000_0", saved[0].0.name);
        assert_eq!("PG3_3000_1", saved[1].0.name);
    }

    #[tokio::test]
    async fn test_container_subtraction() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 100, 5));
        job.insert(1500, test_utils::random_events(1500, 2, 100, 5));
        let summary = job
            .run(
                r#""run_number": [1000],
                "background_number": [1500],
                "vanadium_number": [-1],
                "binning": [0.5, 0.5, 3.0]"#,
                1,
            )
            .await
            .unwrap();
        assert!(summary.failed.is_empty());
        let saved = job.writer.saved();
        assert_eq!(1, saved.len());
        assert!(saved[0].0.total_counts().abs() < 1e-9);
        assert_eq!(None, saved[0].0.run.property("van_number"));
    }

    #[tokio::test]
    async fn test_failed_run_does_not_abort_job() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 50, 1));
        let summary = job
            .run(
                r#""run_number": [9999, 1000],
                "vanadium_number": [-1],
                "binning": [0.5, 0.5, 3.0]"#,
                1,
            )
            .await
            .unwrap();
        assert_eq!(1, summary.failed.len());
        assert_eq!(9999, summary.failed[0].run_number);
        assert_eq!(
            "failed to reduce run 9999 during PerRunReducing",
            summary.failed[0].error.message
        );
        assert_eq!(1, job.writer.saved().len());
    }

    #[tokio::test]
    async fn test_incompatible_sum_aborts_job() {
        let job = Job::new();
        for (run_number, frequency) in [(1000, 60.0), (1001, 30.0)] {
            let mut dataset = test_utils::random_events(run_number, 2, 20, 1);
            dataset.run.logs.insert("frequency".to_string(), vec![frequency]);
            job.insert(run_number, dataset);
        }
        let result = job
            .run(
                r#""run_number": [1000, 1001],
                "sum": true,
                "vanadium_number": [-1],
                "binning": [0.5, 0.5, 3.0]"#,
                1,
            )
            .await;
        let error = result.unwrap_err();
        assert_eq!(ErrorScope::Job, error.scope());
        assert_eq!("failed to reduce run 1000 during Summing", error.to_string());
        assert!(job.writer.saved().is_empty());
    }

    #[tokio::test]
    async fn test_vanadium_only() {
        let job = Job::new();
        job.insert(2000, test_utils::random_events(2000, 2, 100, 2));
        let summary = job
            .run(
                r#""run_number": [0],
                "vanadium_number": [2000],
                "binning": [0.5, 0.5, 3.0]"#,
                1,
            )
            .await
            .unwrap();
        assert!(summary.failed.is_empty());
        assert!(summary.saved.is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_directory() {
        let job = Job::new();
        let mut request = job.request(r#""binning": [0.5, 0.5, 3.0]"#);
        request.output_directory = PathBuf::from("/no/such/directory");
        let result = run_job(request, job.loader.clone(), job.writer.clone(), 1, false).await;
        assert!(matches!(
            result,
            Err(ReductionError::OutputDirectoryMissing { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distributed_job_aborts_together() {
        // Chunk 2 of run 1000 goes to worker 1, whose failure must stop the leader too.
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 100, 1));
        job.insert(1001, test_utils::random_events(1001, 2, 100, 2));
        job.loader.fail_chunk(&RunId::new("PG3", 1000, "_event.json"), 2, || {
            ReductionError::IncompatibleDatasets {
                operation: "add",
                reason: "bin edges differ".to_string(),
            }
        });
        let extra = r#""run_number": [1000, 1001],
            "vanadium_number": [-1],
            "binning": [0.1]"#;
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), job.run(extra, 2))
            .await
            .expect("workers did not finish");
        let error = result.unwrap_err();
        assert_eq!(ErrorScope::Job, error.scope());
        assert_eq!(
            "failed to reduce run 1000 during PerRunReducing",
            error.to_string()
        );
        assert!(job.writer.saved().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distributed_job_skips_failed_run_together() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 100, 1));
        job.insert(1001, test_utils::random_events(1001, 2, 100, 2));
        job.loader.fail_chunk(&RunId::new("PG3", 1000, "_event.json"), 2, || {
            ReductionError::NoData { run_number: 1000 }
        });
        let extra = r#""run_number": [1000, 1001],
            "vanadium_number": [-1],
            "binning": [0.1]"#;
        let summary = tokio::time::timeout(std::time::Duration::from_secs(10), job.run(extra, 2))
            .await
            .expect("workers did not finish")
            .unwrap();
        assert_eq!(1, summary.failed.len());
        assert_eq!(1000, summary.failed[0].run_number);
        let saved = job.writer.saved();
        assert_eq!(1, saved.len());
        assert_eq!("PG3_1001", saved[0].0.name);
    }

    #[tokio::test]
    async fn test_width_binning_chunked() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 100, 1));
        let summary = job
            .run(
                r#""run_number": [1000],
                "vanadium_number": [-1],
                "binning": [0.1],
                "preserve_events": false"#,
                1,
            )
            .await
            .unwrap();
        assert!(summary.failed.is_empty());
        let saved = job.writer.saved();
        assert_eq!(1, saved.len());
        assert!(!saved[0].0.is_event());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distributed_job() {
        let job = Job::new();
        job.insert(1000, test_utils::random_events(1000, 2, 200, 1));
        job.insert(2000, test_utils::random_events(2000, 2, 400, 2));
        let extra = r#""run_number": [1000],
            "vanadium_number": [2000],
            "binning": [0.5, 0.5, 3.0],
            "push_data_positive": "reset-to-zero""#;
        let summary = job.run(extra, 2).await.unwrap();
        assert!(summary.failed.is_empty());
        // Only the leader writes.
        assert_eq!(1, job.writer.saved().len());
        assert_eq!(1, summary.saved.len());
    }
}
