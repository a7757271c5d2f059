//! Reference loader for JSON run files.
//!
//! A run file `{instrument}_{run}{extension}` in the data directory holds the run metadata and
//! either event lists or a histogram:
//!
//! ```json
//! {
//!   "run_number": 1000,
//!   "start_time_ns": 0,
//!   "logs": {"frequency": [60.0]},
//!   "proton_charge": [[0, 1.0], [16666667, 1.0]],
//!   "data": {"kind": "events", "spectra": [{"spectrum": 1, "events": [[1500.0, 0]]}]}
//! }
//! ```

use async_trait::async_trait;
use ndarray::{Array1, Array2};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{event, Level};

use crate::characterization::CharacterizationTable;
use crate::chunking::{ChunkDescriptor, RunId};
use crate::error::ReductionError;
use crate::operation::Loader;
use crate::splitter::TimeFilterWall;
use crate::types::{Dataset, DatasetData, Event, EventList, Histogram, RunInfo, Units};

/// Run metadata as stored in a run file.
#[derive(Debug, Deserialize)]
struct RunHeader {
    run_number: i64,
    #[serde(default)]
    start_time_ns: i64,
    #[serde(default)]
    logs: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    proton_charge: Vec<(i64, f64)>,
}

impl From<RunHeader> for RunInfo {
    fn from(header: RunHeader) -> Self {
        RunInfo {
            run_number: header.run_number,
            start_time_ns: header.start_time_ns,
            logs: header.logs,
            proton_charge: header.proton_charge.into_iter().collect(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventSpectrum {
    spectrum: i32,
    #[serde(default)]
    events: Vec<(f64, i64)>,
}

#[derive(Debug, Deserialize)]
struct HistogramSpectrum {
    spectrum: i32,
    counts: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RunData {
    Events {
        spectra: Vec<EventSpectrum>,
    },
    Histogram {
        edges: Vec<f64>,
        spectra: Vec<HistogramSpectrum>,
    },
}

/// A whole run file.
#[derive(Debug, Deserialize)]
struct RunFile {
    #[serde(flatten)]
    header: RunHeader,
    data: RunData,
}

impl RunFile {
    /// Convert to a time of flight dataset.
    fn into_dataset(self, name: &str) -> Result<Dataset, ReductionError> {
        let run = RunInfo::from(self.header);
        match self.data {
            RunData::Events { spectra } => {
                let spectra = spectra
                    .into_iter()
                    .map(|spectrum| {
                        let events = spectrum
                            .events
                            .into_iter()
                            .map(|(tof, pulse)| Event::new(tof, pulse))
                            .collect();
                        EventList::new(spectrum.spectrum, events)
                    })
                    .collect();
                Ok(Dataset::events(name, Units::TimeOfFlight, spectra, run))
            }
            RunData::Histogram { edges, spectra } => {
                let bins = edges.len().saturating_sub(1);
                let spectrum_numbers: Vec<i32> =
                    spectra.iter().map(|spectrum| spectrum.spectrum).collect();
                let counts: Vec<f64> = spectra
                    .into_iter()
                    .flat_map(|spectrum| spectrum.counts)
                    .collect();
                let counts = Array2::from_shape_vec((spectrum_numbers.len(), bins), counts)?;
                let histogram = Histogram {
                    edges: Array1::from_vec(edges),
                    errors: counts.mapv(|count: f64| count.abs().sqrt()),
                    counts,
                    spectrum_numbers,
                };
                Ok(Dataset::histogram(
                    name,
                    Units::TimeOfFlight,
                    histogram,
                    run,
                ))
            }
        }
    }
}

/// Plan `total` chunks of a dataset.
///
/// Event data is cut into index slices, histogram data into spectrum ranges. A single chunk is
/// an empty plan.
pub fn chunk_plan(dataset: &Dataset, total: usize) -> Vec<ChunkDescriptor> {
    if total <= 1 {
        return vec![];
    }
    match &dataset.data {
        DatasetData::Events(_) => (1..=total)
            .map(|number| ChunkDescriptor::Index { number, total })
            .collect(),
        DatasetData::Histogram(histogram) => {
            let mut numbers = histogram.spectrum_numbers.clone();
            numbers.sort_unstable();
            let size = numbers.len().div_ceil(total).max(1);
            numbers
                .chunks(size)
                .filter_map(|range| match (range.first(), range.last()) {
                    (Some(min), Some(max)) => Some(ChunkDescriptor::SpectrumRange {
                        min: *min,
                        max: *max,
                    }),
                    _ => None,
                })
                .collect()
        }
    }
}

/// Bounds of slice `number` (1-based) of `total` of a list of `len` items.
fn slice_bounds(len: usize, number: usize, total: usize) -> (usize, usize) {
    let total = total.max(1);
    let number = number.clamp(1, total);
    (len * (number - 1) / total, len * number / total)
}

/// Cut one chunk out of a whole run.
///
/// Spectra are kept in every chunk so that chunks can be added back together: events outside
/// the chunk are dropped and histogram rows outside it are zeroed. Every chunk carries the pulse
/// log of the run. Events and pulses outside the wall are dropped.
///
/// # Arguments
///
/// * `dataset`: The whole run
/// * `chunk`: Chunk to select
/// * `wall`: Time filter wall, relative to the run start
pub fn select_chunk(dataset: &Dataset, chunk: &ChunkDescriptor, wall: TimeFilterWall) -> Dataset {
    let mut selected = dataset.clone();
    let bounds = wall.absolute_bounds(dataset.run.start_time_ns);
    if let Some((start, stop)) = bounds {
        selected.run.restrict_pulses(start, stop);
    }
    let in_range = |spectrum_number: i32| match chunk {
        ChunkDescriptor::SpectrumRange { min, max } => (*min..=*max).contains(&spectrum_number),
        _ => true,
    };
    match &mut selected.data {
        DatasetData::Events(events) => {
            for spectrum in events.spectra.iter_mut() {
                if !in_range(spectrum.spectrum_number) {
                    spectrum.events.clear();
                    continue;
                }
                if let ChunkDescriptor::Index { number, total } = chunk {
                    let (begin, end) = slice_bounds(spectrum.events.len(), *number, *total);
                    spectrum.events = spectrum.events[begin..end].to_vec();
                }
                if let Some((start, stop)) = bounds {
                    spectrum
                        .events
                        .retain(|event| event.pulse_time_ns >= start && event.pulse_time_ns < stop);
                }
            }
        }
        DatasetData::Histogram(histogram) => {
            let rows = histogram.spectrum_numbers.len();
            let kept: Vec<bool> = histogram
                .spectrum_numbers
                .iter()
                .enumerate()
                .map(|(row, spectrum_number)| match chunk {
                    ChunkDescriptor::Index { number, total } => {
                        let (begin, end) = slice_bounds(rows, *number, *total);
                        (begin..end).contains(&row)
                    }
                    _ => in_range(*spectrum_number),
                })
                .collect();
            for (row, keep) in kept.into_iter().enumerate() {
                if !keep {
                    histogram.counts.row_mut(row).fill(0.0);
                    histogram.errors.row_mut(row).fill(0.0);
                }
            }
        }
    }
    selected
}

/// Loads JSON run files from a data directory.
///
/// JSON cannot be read in part, so every chunk parses the whole file and keeps its own slice.
/// Chunking bounds the data focused and accumulated at a time, not the memory used by parsing.
/// A loader for an indexed format can read only the chunk instead.
#[derive(Clone, Debug)]
pub struct FileLoader {
    data_dir: PathBuf,
}

impl FileLoader {
    /// Return a new FileLoader.
    ///
    /// # Arguments
    ///
    /// * `data_dir`: Directory holding the run files
    pub fn new(data_dir: &Path) -> Self {
        FileLoader {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Path of a run file.
    pub fn path(&self, run: &RunId) -> PathBuf {
        self.data_dir.join(run.file_name())
    }

    async fn read(&self, path: &Path) -> Result<String, ReductionError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => ReductionError::FileNotFound {
                    path: path.to_path_buf(),
                },
                _ => ReductionError::Io(error),
            })
    }

    async fn load_whole(&self, run: &RunId) -> Result<Dataset, ReductionError> {
        let path = self.path(run);
        let text = self.read(&path).await?;
        let file: RunFile = serde_json::from_str(&text)
            .map_err(|source| ReductionError::MalformedFile { path, source })?;
        file.into_dataset(&run.name())
    }
}

#[async_trait]
impl Loader for FileLoader {
    async fn plan_chunks(
        &self,
        run: &RunId,
        max_chunk_bytes: u64,
    ) -> Result<Vec<ChunkDescriptor>, ReductionError> {
        let path = self.path(run);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => ReductionError::FileNotFound { path: path.clone() },
                _ => ReductionError::Io(error),
            })?;
        if max_chunk_bytes == 0 {
            return Ok(vec![]);
        }
        let total = metadata.len().div_ceil(max_chunk_bytes) as usize;
        event!(
            Level::DEBUG,
            "{} is {} bytes, {} chunk(s) of at most {} bytes",
            run,
            metadata.len(),
            total,
            max_chunk_bytes
        );
        if total <= 1 {
            return Ok(vec![]);
        }
        let dataset = self.load_whole(run).await?;
        Ok(chunk_plan(&dataset, total))
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn load_chunk(
        &self,
        run: &RunId,
        chunk: &ChunkDescriptor,
        wall: TimeFilterWall,
    ) -> Result<Dataset, ReductionError> {
        let dataset = self.load_whole(run).await?;
        Ok(select_chunk(&dataset, chunk, wall))
    }

    async fn load_metadata(&self, run: &RunId) -> Result<RunInfo, ReductionError> {
        let path = self.path(run);
        let text = self.read(&path).await?;
        let header: RunHeader = serde_json::from_str(&text)
            .map_err(|source| ReductionError::MalformedFile { path, source })?;
        Ok(header.into())
    }

    async fn load_characterizations(
        &self,
        path: &Path,
    ) -> Result<CharacterizationTable, ReductionError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|error| {
            ReductionError::InvalidCharacterizations {
                path: path.to_path_buf(),
                reason: error.to_string(),
            }
        })?;
        CharacterizationTable::parse(path, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    const EVENT_FILE: &str = r#"{
        "run_number": 1000,
        "start_time_ns": 1000000000,
        "logs": {"frequency": [60.0, 60.0]},
        "proton_charge": [[1000000000, 1.0], [2000000000, 1.0], [3000000000, 1.0]],
        "data": {
            "kind": "events",
            "spectra": [
                {"spectrum": 1, "events": [[1000.0, 1000000000], [1500.0, 2000000000], [2000.0, 3000000000]]},
                {"spectrum": 2, "events": [[2500.0, 2000000000]]}
            ]
        }
    }"#;

    const HISTOGRAM_FILE: &str = r#"{
        "run_number": 1001,
        "data": {
            "kind": "histogram",
            "edges": [0.0, 10.0, 20.0],
            "spectra": [{"spectrum": 1, "counts": [4.0, 9.0]}, {"spectrum": 2, "counts": [1.0, 0.0]}]
        }
    }"#;

    fn write_run(dir: &Path, run: &RunId, text: &str) {
        std::fs::write(dir.join(run.file_name()), text).unwrap();
    }

    fn event_run() -> RunId {
        RunId::new("PG3", 1000, "_event.json")
    }

    #[tokio::test]
    async fn test_load_events() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &event_run(), EVENT_FILE);
        let loader = FileLoader::new(dir.path());
        let dataset = loader
            .load_chunk(&event_run(), &ChunkDescriptor::Whole, TimeFilterWall::NONE)
            .await
            .unwrap();
        assert_eq!("PG3_1000", dataset.name);
        assert_eq!(Units::TimeOfFlight, dataset.units);
        assert_eq!(Some(4), dataset.number_events());
        assert_eq!(3.0, dataset.run.integrated_proton_charge());
        assert_eq!(vec![1, 2], dataset.spectrum_numbers());
    }

    #[tokio::test]
    async fn test_load_histogram() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new("PG3", 1001, "_event.json");
        write_run(dir.path(), &run, HISTOGRAM_FILE);
        let loader = FileLoader::new(dir.path());
        let dataset = loader
            .load_chunk(&run, &ChunkDescriptor::Whole, TimeFilterWall::NONE)
            .await
            .unwrap();
        let DatasetData::Histogram(histogram) = &dataset.data else {
            panic!("expected histogram")
        };
        assert_eq!(vec![4.0, 9.0, 1.0, 0.0], histogram.counts.iter().copied().collect::<Vec<_>>());
        assert_eq!(vec![2.0, 3.0, 1.0, 0.0], histogram.errors.iter().copied().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_load_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &event_run(), EVENT_FILE);
        let loader = FileLoader::new(dir.path());
        let info = loader.load_metadata(&event_run()).await.unwrap();
        assert_eq!(1000, info.run_number);
        assert_eq!(1_000_000_000, info.start_time_ns);
        assert_eq!(Some(60.0), info.log_mean(&["frequency"]));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FileLoader::new(dir.path());
        let expected = dir.path().join("PG3_1000_event.json");
        match loader.load_metadata(&event_run()).await {
            Err(ReductionError::FileNotFound { path }) => assert_eq!(expected, path),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            loader.plan_chunks(&event_run(), 0).await,
            Err(ReductionError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &event_run(), "{\"run_number\": ");
        let loader = FileLoader::new(dir.path());
        let result = loader
            .load_chunk(&event_run(), &ChunkDescriptor::Whole, TimeFilterWall::NONE)
            .await;
        assert!(matches!(result, Err(ReductionError::MalformedFile { .. })));
    }

    #[tokio::test]
    async fn test_plan_chunks() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &event_run(), EVENT_FILE);
        let loader = FileLoader::new(dir.path());
        let size = EVENT_FILE.len() as u64;
        assert!(loader.plan_chunks(&event_run(), 0).await.unwrap().is_empty());
        assert!(loader.plan_chunks(&event_run(), size).await.unwrap().is_empty());
        let plan = loader.plan_chunks(&event_run(), size / 3 + 1).await.unwrap();
        assert_eq!(
            vec![
                ChunkDescriptor::Index { number: 1, total: 3 },
                ChunkDescriptor::Index { number: 2, total: 3 },
                ChunkDescriptor::Index { number: 3, total: 3 },
            ],
            plan
        );
    }

    #[test]
    fn test_histogram_plan() {
        let mut dataset = test_utils::histogram_run(1, &[1.0]);
        if let DatasetData::Histogram(histogram) = &mut dataset.data {
            *histogram = Histogram::zeros(Array1::from_vec(vec![0.0, 1.0]), vec![5, 1, 2, 3, 4]);
        }
        assert_eq!(
            vec![
                ChunkDescriptor::SpectrumRange { min: 1, max: 3 },
                ChunkDescriptor::SpectrumRange { min: 4, max: 5 },
            ],
            chunk_plan(&dataset, 2)
        );
        assert!(chunk_plan(&dataset, 1).is_empty());
    }

    #[test]
    fn test_index_chunks_cover_run() {
        let dataset = test_utils::random_events(1000, 3, 10, 4);
        let mut events = 0;
        for chunk in chunk_plan(&dataset, 4) {
            let selected = select_chunk(&dataset, &chunk, TimeFilterWall::NONE);
            assert_eq!(dataset.run.proton_charge, selected.run.proton_charge);
            assert_eq!(3, selected.number_spectra());
            events += selected.number_events().unwrap();
        }
        assert_eq!(30, events);
    }

    #[test]
    fn test_spectrum_range_zero_fills() {
        let mut dataset = test_utils::histogram_run(1, &[1.0, 2.0]);
        if let DatasetData::Histogram(histogram) = &mut dataset.data {
            let mut two = Histogram::zeros(histogram.edges.clone(), vec![1, 2]);
            two.counts.fill(1.0);
            *histogram = two;
        }
        let chunk = ChunkDescriptor::SpectrumRange { min: 2, max: 2 };
        let selected = select_chunk(&dataset, &chunk, TimeFilterWall::NONE);
        let DatasetData::Histogram(histogram) = &selected.data else {
            panic!("expected histogram")
        };
        assert_eq!(vec![0.0, 0.0], histogram.counts.row(0).to_vec());
        assert_eq!(vec![1.0, 1.0], histogram.counts.row(1).to_vec());
    }

    #[test]
    fn test_wall_restricts_events_and_pulses() {
        let dataset = test_utils::timed_run(3000, &[1, 20, 60]);
        let wall = TimeFilterWall::new(10.0, 50.0);
        let selected = select_chunk(&dataset, &ChunkDescriptor::Whole, wall);
        assert_eq!(Some(1), selected.number_events());
        assert_eq!(1.0, selected.run.integrated_proton_charge());
    }
}
