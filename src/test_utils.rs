use async_trait::async_trait;
use ndarray::Array1;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::characterization::CharacterizationTable;
use crate::chunking::{ChunkDescriptor, RunId};
use crate::corrections::ReferenceCorrections;
use crate::error::ReductionError;
use crate::focus::{Calibration, DiffractionFocus};
use crate::gather::Gatherer;
use crate::loader;
use crate::models::ReductionRequest;
use crate::operation::{Loader, OutputWriter, SaveRequest};
use crate::pipeline::Collaborators;
use crate::splitter::TimeFilterWall;
use crate::types::{Dataset, Event, EventList, Histogram, RunInfo, Units};
use crate::writer;

/// Calibration used by the tests: spectra 1 and 2 focus into group 1.
const CALIBRATION: &str = "# spectrum difc group\n1 1000.0 1\n2 1200.0 1\n";

/// Pulses per generated run.
const PULSES: i64 = 10;

/// 60 Hz pulse period.
const PULSE_PERIOD_NS: i64 = 16_666_667;

/// Start time spacing of generated runs, so that pulses of different runs never coincide.
const RUN_SPACING_NS: i64 = 1_000_000_000_000;

/// Create a ReductionRequest with only required fields set.
pub(crate) fn get_test_request() -> ReductionRequest {
    ReductionRequest::from_json(
        r#"{"calibration_file": "PG3.cal", "output_directory": "/tmp", "binning": [0.01, -0.02, 3.0]}"#,
    )
    .unwrap()
}

/// Parsed test calibration.
pub(crate) fn calibration() -> Arc<Calibration> {
    Arc::new(Calibration::parse(&PathBuf::from("PG3.cal"), CALIBRATION).unwrap())
}

/// Write the test calibration to a directory and return its path.
pub(crate) fn write_calibration(dir: &Path) -> PathBuf {
    let path = dir.join("PG3.cal");
    std::fs::write(&path, CALIBRATION).unwrap();
    path
}

/// Collaborators backed by in-memory test doubles.
pub(crate) fn collaborators(
    loader: Arc<MemoryLoader>,
    writer: Arc<RecordingWriter>,
    gatherer: Arc<dyn Gatherer>,
) -> Collaborators {
    Collaborators {
        loader,
        focus: Arc::new(DiffractionFocus::new(vec!["frequency".to_string()])),
        corrections: Arc::new(ReferenceCorrections),
        writer,
        gatherer,
        use_rayon: false,
    }
}

/// Histogram run with one spectrum and 10 us wide bins starting at 0.
pub(crate) fn histogram_run(run_number: i64, counts: &[f64]) -> Dataset {
    let edges = Array1::range(0.0, 10.0 * (counts.len() + 1) as f64 - 5.0, 10.0);
    let mut histogram = Histogram::zeros(edges, vec![1]);
    for (bin, count) in counts.iter().enumerate() {
        histogram.counts[[0, bin]] = *count;
        histogram.errors[[0, bin]] = count.abs().sqrt();
    }
    Dataset::histogram(
        &format!("PG3_{}", run_number),
        Units::TimeOfFlight,
        histogram,
        RunInfo::new(run_number, 0),
    )
}

/// Raw event run from (spectrum, times of flight) pairs, all at pulse 0.
pub(crate) fn event_run(run_number: i64, spectra: Vec<(i32, Vec<f64>)>) -> Dataset {
    let spectra = spectra
        .into_iter()
        .map(|(spectrum_number, tofs)| {
            EventList::new(
                spectrum_number,
                tofs.into_iter().map(|tof| Event::new(tof, 0)).collect(),
            )
        })
        .collect();
    Dataset::events(
        &format!("PG3_{}", run_number),
        Units::TimeOfFlight,
        spectra,
        RunInfo::new(run_number, 0),
    )
}

/// Raw event run with one event at 1500 us per pulse, pulses at the given seconds after the
/// run start. Every pulse has unit charge.
pub(crate) fn timed_run(run_number: i64, seconds: &[i64]) -> Dataset {
    let mut run = RunInfo::new(run_number, 0);
    let events = seconds
        .iter()
        .map(|second| {
            let pulse = second * 1_000_000_000;
            run.proton_charge.insert(pulse, 1.0);
            Event::new(1500.0, pulse)
        })
        .collect();
    Dataset::events(
        &format!("PG3_{}", run_number),
        Units::TimeOfFlight,
        vec![EventList::new(1, events)],
        run,
    )
}

/// Focused single spectrum event dataset at the given d-spacings.
pub(crate) fn focused_events(run_number: i64, d_spacings: &[f64]) -> Dataset {
    let events = d_spacings.iter().map(|d| Event::new(*d, 0)).collect();
    Dataset::events(
        &format!("PG3_{}", run_number),
        Units::DSpacing,
        vec![EventList::new(1, events)],
        RunInfo::new(run_number, 0),
    )
}

/// splitmix64, enough for reproducible test data.
fn next_random(state: &mut u64) -> f64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// Raw event run with uniformly distributed times of flight in [1000, 2500) us.
///
/// The same seed gives the same times of flight. Events are spread over 10 pulses of unit
/// charge, offset by the run number.
pub(crate) fn random_events(
    run_number: i64,
    spectra: usize,
    events_per_spectrum: usize,
    seed: u64,
) -> Dataset {
    let start = run_number * RUN_SPACING_NS;
    let mut run = RunInfo::new(run_number, start);
    for pulse in 0..PULSES {
        run.proton_charge.insert(start + pulse * PULSE_PERIOD_NS, 1.0);
    }
    let mut state = seed;
    let spectra = (1..=spectra as i32)
        .map(|spectrum_number| {
            let events = (0..events_per_spectrum)
                .map(|index| {
                    let tof = 1000.0 + 1500.0 * next_random(&mut state);
                    let pulse = start + (index as i64 % PULSES) * PULSE_PERIOD_NS;
                    Event::new(tof, pulse)
                })
                .collect();
            EventList::new(spectrum_number, events)
        })
        .collect();
    Dataset::events(
        &format!("PG3_{}", run_number),
        Units::TimeOfFlight,
        spectra,
        run,
    )
}

/// Loader serving datasets from memory, chunked with the same rules as the file loader.
pub(crate) struct MemoryLoader {
    runs: Mutex<HashMap<RunId, Dataset>>,
    failures: Mutex<HashMap<(RunId, usize), fn() -> ReductionError>>,
    chunks: usize,
}

impl MemoryLoader {
    pub(crate) fn new() -> Self {
        MemoryLoader {
            runs: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            chunks: 1,
        }
    }

    /// Plan this many chunks whenever the chunk size is bounded.
    pub(crate) fn with_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    pub(crate) fn insert(&self, run: &RunId, dataset: Dataset) {
        self.runs.lock().unwrap().insert(run.clone(), dataset);
    }

    /// Fail loading chunk `number` (1-based) of a run with the given error.
    pub(crate) fn fail_chunk(&self, run: &RunId, number: usize, error: fn() -> ReductionError) {
        self.failures
            .lock()
            .unwrap()
            .insert((run.clone(), number), error);
    }

    fn get(&self, run: &RunId) -> Result<Dataset, ReductionError> {
        self.runs
            .lock()
            .unwrap()
            .get(run)
            .cloned()
            .ok_or_else(|| ReductionError::FileNotFound {
                path: PathBuf::from(run.file_name()),
            })
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    async fn plan_chunks(
        &self,
        run: &RunId,
        max_chunk_bytes: u64,
    ) -> Result<Vec<ChunkDescriptor>, ReductionError> {
        let dataset = self.get(run)?;
        if max_chunk_bytes == 0 {
            return Ok(vec![]);
        }
        Ok(loader::chunk_plan(&dataset, self.chunks))
    }

    async fn load_chunk(
        &self,
        run: &RunId,
        chunk: &ChunkDescriptor,
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        if let ChunkDescriptor::Index { number, .. } = chunk {
            if let Some(error) = self.failures.lock().unwrap().get(&(run.clone(), *number)) {
                return Err(error());
            }
        }
        Ok(loader::select_chunk(&self.get(run)?, chunk, wall))
    }

    async fn load_metadata(&self, run: &RunId) -> Result<RunInfo, ReductionError> {
        Ok(self.get(run)?.run)
    }

    async fn load_characterizations(
        &self,
        path: &Path,
    ) -> Result<CharacterizationTable, ReductionError> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            ReductionError::InvalidCharacterizations {
                path: path.to_path_buf(),
                reason: error.to_string(),
            }
        })?;
        CharacterizationTable::parse(path, &text)
    }
}

/// Writer that records what it was asked to save.
pub(crate) struct RecordingWriter {
    saved: Mutex<Vec<(Dataset, SaveRequest)>>,
}

impl RecordingWriter {
    pub(crate) fn new() -> Self {
        RecordingWriter {
            saved: Mutex::new(vec![]),
        }
    }

    pub(crate) fn saved(&self) -> Vec<(Dataset, SaveRequest)> {
        self.saved.lock().unwrap().clone()
    }
}

impl OutputWriter for RecordingWriter {
    fn save(
        &self,
        dataset: &Dataset,
        request: &SaveRequest,
    ) -> Result<Vec<PathBuf>, ReductionError> {
        self.saved
            .lock()
            .unwrap()
            .push((dataset.clone(), request.clone()));
        Ok(request
            .formats
            .iter()
            .map(|format| writer::output_path(&request.prefix, *format))
            .collect())
    }
}
