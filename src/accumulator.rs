//! Step by step accumulation of focused chunks into one dataset per output group.

use strum_macros::Display;
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::operations;
use crate::splitter::{group_name, SplitGroup};
use crate::types::Dataset;

/// Progress of an accumulator.
#[derive(Clone, Copy, Debug, Display, PartialEq)]
pub enum AccumulatorState {
    /// No chunk has been seen
    Empty,
    /// The first chunk has been assigned to every group
    FirstChunkAssigned,
    /// Later chunks are being merged
    Accumulating,
}

/// Accumulates focused chunks of one run, one dataset per output group.
///
/// The number of groups is fixed by the first chunk. Event data is compressed after every merge
/// with the same tolerance.
#[derive(Debug)]
pub struct FocusAccumulator {
    instrument: String,
    run_number: i64,
    compress_tolerance: f64,
    state: AccumulatorState,
    groups: Vec<Dataset>,
}

impl FocusAccumulator {
    /// Return a new, empty FocusAccumulator.
    ///
    /// # Arguments
    ///
    /// * `instrument`: Instrument name, used for group names
    /// * `run_number`: Run being accumulated
    /// * `compress_tolerance`: Event compression tolerance
    pub fn new(instrument: &str, run_number: i64, compress_tolerance: f64) -> Self {
        FocusAccumulator {
            instrument: instrument.to_string(),
            run_number,
            compress_tolerance,
            state: AccumulatorState::Empty,
            groups: vec![],
        }
    }

    /// Current state.
    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    /// Number of groups, once fixed by the first chunk.
    pub fn number_of_groups(&self) -> Option<usize> {
        match self.state {
            AccumulatorState::Empty => None,
            _ => Some(self.groups.len()),
        }
    }

    /// Merge the focused groups of one chunk.
    ///
    /// # Arguments
    ///
    /// * `chunk`: Focused groups of the chunk, in group order
    pub fn accumulate(&mut self, chunk: Vec<SplitGroup>) -> Result<(), ReductionError> {
        match self.state {
            AccumulatorState::Empty => {
                let total = chunk.len();
                self.groups = chunk
                    .into_iter()
                    .map(|split| {
                        let name =
                            group_name(&self.instrument, self.run_number, split.group, total);
                        event!(Level::DEBUG, "Group {} starts as {}", split.group, name);
                        split.dataset.renamed(&name)
                    })
                    .collect();
                self.state = AccumulatorState::FirstChunkAssigned;
            }
            AccumulatorState::FirstChunkAssigned | AccumulatorState::Accumulating => {
                if chunk.len() != self.groups.len() {
                    return Err(ReductionError::GroupCountMismatch {
                        run_number: self.run_number,
                        expected: self.groups.len(),
                        found: chunk.len(),
                    });
                }
                let groups = std::mem::take(&mut self.groups);
                for (accumulated, split) in groups.into_iter().zip(chunk) {
                    let mut merged = operations::add(accumulated, split.dataset)?;
                    operations::compress(&mut merged, self.compress_tolerance);
                    self.groups.push(merged);
                }
                self.state = AccumulatorState::Accumulating;
            }
        }
        Ok(())
    }

    /// Finish accumulation with a final compression pass.
    ///
    /// Returns None if no chunk was accumulated.
    pub fn finalize(self) -> Option<Vec<Dataset>> {
        if self.state == AccumulatorState::Empty {
            return None;
        }
        let mut groups = self.groups;
        for dataset in groups.iter_mut() {
            operations::compress(dataset, self.compress_tolerance);
        }
        Some(groups)
    }
}
