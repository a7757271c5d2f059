//! Splitting of chunk events into time-sliced output groups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ReductionError;
use crate::types::{Dataset, DatasetData, EventList, RunInfo};

/// One interval of a splitters table.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(from = "(i64, i64, i32)", into = "(i64, i64, i32)")]
pub struct SplitterRow {
    /// Absolute start time in nanoseconds
    pub start_ns: i64,
    /// Absolute stop time in nanoseconds, exclusive
    pub stop_ns: i64,
    /// Output group, negative for unfiltered time
    pub group: i32,
}

impl From<(i64, i64, i32)> for SplitterRow {
    fn from((start_ns, stop_ns, group): (i64, i64, i32)) -> Self {
        SplitterRow {
            start_ns,
            stop_ns,
            group,
        }
    }
}

impl From<SplitterRow> for (i64, i64, i32) {
    fn from(row: SplitterRow) -> Self {
        (row.start_ns, row.stop_ns, row.group)
    }
}

/// Assignment of real time to output groups.
///
/// Rows are kept sorted by start time. Time not covered by any row is discarded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(from = "Vec<SplitterRow>", into = "Vec<SplitterRow>")]
pub struct SplitterTable {
    rows: Vec<SplitterRow>,
}

impl From<Vec<SplitterRow>> for SplitterTable {
    fn from(rows: Vec<SplitterRow>) -> Self {
        SplitterTable::new(rows)
    }
}

impl From<SplitterTable> for Vec<SplitterRow> {
    fn from(table: SplitterTable) -> Self {
        table.rows
    }
}

impl SplitterTable {
    /// Return a new SplitterTable.
    ///
    /// Unfiltered rows (negative group) are dropped.
    pub fn new(mut rows: Vec<SplitterRow>) -> Self {
        rows.retain(|row| row.group >= 0 && row.stop_ns > row.start_ns);
        rows.sort_by_key(|row| row.start_ns);
        SplitterTable { rows }
    }

    /// Rows of the table, sorted by start time.
    pub fn rows(&self) -> &[SplitterRow] {
        &self.rows
    }

    /// Distinct group indices, ascending.
    pub fn groups(&self) -> Vec<i32> {
        let mut groups: Vec<i32> = self.rows.iter().map(|row| row.group).collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Number of distinct groups.
    pub fn number_of_groups(&self) -> usize {
        self.groups().len()
    }

    /// Group of an absolute time, if it falls in a row.
    pub fn group_of(&self, time_ns: i64) -> Option<i32> {
        let index = self.rows.partition_point(|row| row.start_ns <= time_ns);
        let row = self.rows.get(index.checked_sub(1)?)?;
        (time_ns < row.stop_ns).then_some(row.group)
    }

    /// Earliest start and latest stop over all rows.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        let start = self.rows.iter().map(|row| row.start_ns).min()?;
        let stop = self.rows.iter().map(|row| row.stop_ns).max()?;
        Some((start, stop))
    }
}

/// Human readable labels of the output groups.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "Vec<(i32, String)>")]
pub struct SplitInformationTable {
    labels: BTreeMap<i32, String>,
}

impl From<Vec<(i32, String)>> for SplitInformationTable {
    fn from(rows: Vec<(i32, String)>) -> Self {
        SplitInformationTable {
            labels: rows.into_iter().collect(),
        }
    }
}

impl SplitInformationTable {
    /// Label of a group.
    pub fn label(&self, group: i32) -> Option<&str> {
        self.labels.get(&group).map(String::as_str)
    }
}

/// Time window relative to run start, in seconds, applied at load time.
///
/// `(0, 0)` means no filter. A stop of 0 means no upper bound.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeFilterWall {
    pub start_seconds: f64,
    pub stop_seconds: f64,
}

impl TimeFilterWall {
    /// The wall that filters nothing.
    pub const NONE: TimeFilterWall = TimeFilterWall {
        start_seconds: 0.0,
        stop_seconds: 0.0,
    };

    /// Return a new TimeFilterWall.
    pub fn new(start_seconds: f64, stop_seconds: f64) -> Self {
        TimeFilterWall {
            start_seconds,
            stop_seconds,
        }
    }

    /// Derive the wall from the extent of a splitters table.
    ///
    /// # Arguments
    ///
    /// * `table`: Splitters table with absolute times
    /// * `run_start_ns`: Absolute start time of the run
    pub fn from_table(table: &SplitterTable, run_start_ns: i64) -> Self {
        match table.bounds() {
            Some((start, stop)) => TimeFilterWall::new(
                (start - run_start_ns) as f64 / 1e9,
                (stop - run_start_ns) as f64 / 1e9,
            ),
            None => TimeFilterWall::NONE,
        }
    }

    /// Returns true if both bounds are zero.
    pub fn is_degenerate(&self) -> bool {
        self.start_seconds.abs() < 1e-9 && self.stop_seconds.abs() < 1e-9
    }

    /// Absolute bounds `[start, stop)` in nanoseconds, or None if the wall filters nothing.
    pub fn absolute_bounds(&self, run_start_ns: i64) -> Option<(i64, i64)> {
        if self.is_degenerate() {
            return None;
        }
        let start = run_start_ns + (self.start_seconds * 1e9).round() as i64;
        let stop = if self.stop_seconds.abs() < 1e-9 {
            i64::MAX
        } else {
            run_start_ns + (self.stop_seconds * 1e9).round() as i64
        };
        Some((start, stop))
    }
}

/// Name of an output group.
pub fn group_name(instrument: &str, run_number: i64, group: i32, number_of_groups: usize) -> String {
    if number_of_groups > 1 {
        format!("{}_{}_{}", instrument, run_number, group)
    } else {
        format!("{}_{}", instrument, run_number)
    }
}

/// A sub-dataset destined for one output group.
#[derive(Clone, Debug)]
pub struct SplitGroup {
    /// Group index from the splitters table, 0 when not splitting
    pub group: i32,
    /// Events of the group
    pub dataset: Dataset,
}

/// Return the chunk as a single group.
fn whole(mut chunk: Dataset, group: i32, information: Option<&SplitInformationTable>) -> SplitGroup {
    if let Some(label) = information.and_then(|info| info.label(group)) {
        chunk.run.set_property("split_label", label);
    }
    SplitGroup {
        group,
        dataset: chunk,
    }
}

/// Split a loaded chunk into output groups.
///
/// When the table has at most one group, the chunk is returned whole: the time filter wall
/// applied at load time has already restricted it. Histogram chunks cannot be split and always
/// form a single group.
///
/// # Arguments
///
/// * `chunk`: Loaded chunk
/// * `splitters`: Optional splitters table
/// * `information`: Optional labels for the groups
/// * `wall`: Time filter wall used to load the chunk
/// * `instrument`: Instrument name, used for group names
pub fn split_chunk(
    chunk: Dataset,
    splitters: Option<&SplitterTable>,
    information: Option<&SplitInformationTable>,
    wall: TimeFilterWall,
    instrument: &str,
) -> Result<Vec<SplitGroup>, ReductionError> {
    let Some(table) = splitters else {
        return Ok(vec![SplitGroup {
            group: 0,
            dataset: chunk,
        }]);
    };
    if wall.is_degenerate() {
        return Err(ReductionError::DegenerateFilterWall);
    }
    let groups = table.groups();
    if groups.len() <= 1 {
        let group = groups.first().copied().unwrap_or(0);
        return Ok(vec![whole(chunk, group, information)]);
    }

    let run_number = chunk.run.run_number;
    let Dataset {
        name,
        units,
        data,
        run,
        geometry,
    } = chunk;
    let events = match data {
        DatasetData::Events(events) => events,
        data => {
            let chunk = Dataset {
                name,
                units,
                data,
                run,
                geometry,
            };
            return Ok(vec![whole(chunk, 0, information)]);
        }
    };

    // Position of each group in the output.
    let slots: BTreeMap<i32, usize> = groups
        .iter()
        .enumerate()
        .map(|(slot, group)| (*group, slot))
        .collect();
    let mut spectra: Vec<Vec<EventList>> = vec![
        events
            .spectra
            .iter()
            .map(|spectrum| EventList::empty(spectrum.spectrum_number))
            .collect();
        groups.len()
    ];
    for (index, spectrum) in events.spectra.into_iter().enumerate() {
        for event in spectrum.events {
            if let Some(group) = table.group_of(event.pulse_time_ns) {
                spectra[slots[&group]][index].events.push(event);
            }
        }
    }

    let mut runs: Vec<RunInfo> = groups
        .iter()
        .map(|_| RunInfo {
            proton_charge: BTreeMap::new(),
            ..run.clone()
        })
        .collect();
    for (time, charge) in &run.proton_charge {
        if let Some(group) = table.group_of(*time) {
            runs[slots[&group]].proton_charge.insert(*time, *charge);
        }
    }

    let split = groups
        .iter()
        .zip(spectra)
        .zip(runs)
        .map(|((group, spectra), mut run)| {
            if let Some(label) = information.and_then(|info| info.label(*group)) {
                run.set_property("split_label", label);
            }
            let name = group_name(instrument, run_number, *group, groups.len());
            let mut dataset = Dataset::events(&name, units, spectra, run);
            dataset.geometry = geometry.clone();
            if let DatasetData::Events(data) = &mut dataset.data {
                data.edges = events.edges.clone();
            }
            SplitGroup {
                group: *group,
                dataset,
            }
        })
        .collect();
    Ok(split)
}
