//! Chunk planning and assignment of chunks to workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::operation::Loader;

/// A run to load: instrument, run number and raw file extension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunId {
    pub instrument: String,
    pub number: i64,
    pub extension: String,
}

impl RunId {
    /// Return a new RunId.
    pub fn new(instrument: &str, number: i64, extension: &str) -> Self {
        RunId {
            instrument: instrument.to_string(),
            number,
            extension: extension.to_string(),
        }
    }

    /// Dataset name of the run, e.g. `PG3_1000`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.instrument, self.number)
    }

    /// Raw file name of the run.
    pub fn file_name(&self) -> String {
        format!("{}_{}{}", self.instrument, self.number, self.extension)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// Load-time constraints selecting one chunk of a run.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum ChunkDescriptor {
    /// The whole file
    Whole,
    /// Chunk `number` (1-based) of `total` equal slices
    Index { number: usize, total: usize },
    /// Spectra `min..=max`
    SpectrumRange { min: i32, max: i32 },
}

impl fmt::Display for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkDescriptor::Whole => write!(f, "_0"),
            ChunkDescriptor::Index { number, .. } => write!(f, "_{}", number),
            ChunkDescriptor::SpectrumRange { min, max } if max > min => {
                write!(f, "_{}", 1 + min / (max - min))
            }
            ChunkDescriptor::SpectrumRange { min, .. } => write!(f, "_{}", min),
        }
    }
}

/// Produce the ordered chunk sequence of a run.
///
/// An empty plan from the loader means the whole file is read in one go.
///
/// # Arguments
///
/// * `loader`: Loader to query
/// * `run`: Run to plan
/// * `max_chunk_bytes`: Maximum chunk size in bytes, 0 for unbounded
pub async fn plan_chunks(
    loader: &dyn Loader,
    run: &RunId,
    max_chunk_bytes: u64,
) -> Result<Vec<ChunkDescriptor>, ReductionError> {
    let mut chunks = loader.plan_chunks(run, max_chunk_bytes).await?;
    if chunks.is_empty() {
        chunks.push(ChunkDescriptor::Whole);
    }
    event!(Level::DEBUG, "{} will be loaded in {} chunk(s)", run, chunks.len());
    Ok(chunks)
}

/// Chunks belonging to one worker, with their position in the full plan.
///
/// Chunk `i` belongs to worker `i % size`.
///
/// # Arguments
///
/// * `chunks`: Full chunk plan
/// * `rank`: Rank of the worker
/// * `size`: Number of workers
pub fn assign_round_robin(
    chunks: Vec<ChunkDescriptor>,
    rank: usize,
    size: usize,
) -> Vec<(usize, ChunkDescriptor)> {
    let size = size.max(1);
    chunks
        .into_iter()
        .enumerate()
        .filter(|(index, _)| index % size == rank)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryLoader;

    #[test]
    fn test_run_id() {
        let run = RunId::new("PG3", 1000, "_event.json");
        assert_eq!("PG3_1000", run.name());
        assert_eq!("PG3_1000_event.json", run.file_name());
        assert_eq!("PG3_1000_event.json", run.to_string());
    }

    #[test]
    fn test_chunk_suffix() {
        assert_eq!("_0", ChunkDescriptor::Whole.to_string());
        let chunk = ChunkDescriptor::Index {
            number: 3,
            total: 4,
        };
        assert_eq!("_3", chunk.to_string());
        let chunk = ChunkDescriptor::SpectrumRange { min: 1, max: 10 };
        assert_eq!("_1", chunk.to_string());
        let chunk = ChunkDescriptor::SpectrumRange { min: 11, max: 20 };
        assert_eq!("_2", chunk.to_string());
        let chunk = ChunkDescriptor::SpectrumRange { min: 7, max: 7 };
        assert_eq!("_7", chunk.to_string());
    }

    #[test]
    fn test_round_robin() {
        let chunks: Vec<_> = (1..=5)
            .map(|number| ChunkDescriptor::Index { number, total: 5 })
            .collect();
        let rank0 = assign_round_robin(chunks.clone(), 0, 2);
        let rank1 = assign_round_robin(chunks.clone(), 1, 2);
        assert_eq!(vec![0, 2, 4], rank0.iter().map(|(i, _)| *i).collect::<Vec<_>>());
        assert_eq!(vec![1, 3], rank1.iter().map(|(i, _)| *i).collect::<Vec<_>>());
        assert_eq!(5, assign_round_robin(chunks.clone(), 0, 1).len());
        assert!(assign_round_robin(chunks[..1].to_vec(), 1, 2).is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_is_whole() {
        let loader = MemoryLoader::new();
        let run = RunId::new("PG3", 1, "_event.json");
        loader.insert(&run, crate::test_utils::timed_run(1, &[1]));
        let chunks = plan_chunks(&loader, &run, 0).await.unwrap();
        assert_eq!(vec![ChunkDescriptor::Whole], chunks);
    }

    #[tokio::test]
    async fn test_plan_bounded() {
        let loader = MemoryLoader::new().with_chunks(3);
        let run = RunId::new("PG3", 1, "_event.json");
        loader.insert(&run, crate::test_utils::timed_run(1, &[1, 2, 3]));
        let chunks = plan_chunks(&loader, &run, 10).await.unwrap();
        assert_eq!(3, chunks.len());
        assert_eq!(
            ChunkDescriptor::Index {
                number: 1,
                total: 3
            },
            chunks[0]
        );
    }

    #[tokio::test]
    async fn test_plan_missing_run() {
        let loader = MemoryLoader::new();
        let run = RunId::new("PG3", 1, "_event.json");
        let result = plan_chunks(&loader, &run, 0).await;
        assert!(matches!(result, Err(ReductionError::FileNotFound { .. })));
    }
}
