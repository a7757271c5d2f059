//! Characterization runs: which container and vanadium runs apply to a sample run.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::types::RunInfo;

/// Relative tolerance when matching frequency and wavelength.
const MATCH_TOLERANCE: f64 = 0.05;

/// Output bank used when no characterization row applies.
pub const DEFAULT_BANK: u32 = 1;

/// Instrument geometry used to edit the focused spectra.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FocusPositions {
    /// Primary flight path in metres
    pub primary_flight_path: f64,
    /// Focused spectrum numbers
    pub spectrum_numbers: Vec<i32>,
    /// Secondary flight paths in metres
    pub l2: Vec<f64>,
    /// Polar angles in degrees
    pub polar: Vec<f64>,
    /// Azimuthal angles in degrees
    pub azimuthal: Vec<f64>,
}

impl FocusPositions {
    /// Polar angle of a focused spectrum, in degrees.
    pub fn polar_of(&self, spectrum_number: i32) -> Option<f64> {
        self.spectrum_numbers
            .iter()
            .position(|number| *number == spectrum_number)
            .and_then(|index| self.polar.get(index).copied())
    }

    /// Geometry with every per-spectrum array repeated once, for low resolution spectra.
    ///
    /// Only applies when the primary flight path is positive.
    pub fn duplicated_for_low_res(mut self) -> Self {
        if self.primary_flight_path > 0.0 {
            self.spectrum_numbers.extend_from_within(..);
            self.l2.extend_from_within(..);
            self.polar.extend_from_within(..);
            self.azimuthal.extend_from_within(..);
        }
        self
    }
}

/// One row of a characterization table.
#[derive(Clone, Debug, PartialEq)]
pub struct CharacterizationRow {
    pub frequency: f64,
    pub wavelength: f64,
    pub bank: u32,
    pub vanadium: i64,
    pub container: i64,
    pub vanadium_background: i64,
    pub d_min: f64,
    pub d_max: f64,
}

/// Characterization runs keyed by frequency and wavelength.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CharacterizationTable {
    /// Instrument parameter file for GSAS output
    pub iparm_file: Option<String>,
    /// Focused geometry
    pub positions: Option<FocusPositions>,
    /// Characterization rows
    pub rows: Vec<CharacterizationRow>,
}

fn parse_numbers(content: &str) -> Option<Vec<f64>> {
    content
        .split_whitespace()
        .map(|token| token.parse::<f64>().ok())
        .collect()
}

impl CharacterizationTable {
    /// Parse a characterization file.
    ///
    /// # Arguments
    ///
    /// * `path`: Path of the file, used in errors
    /// * `text`: Contents of the file
    pub fn parse(path: &Path, text: &str) -> Result<Self, ReductionError> {
        let invalid = |line: usize, reason: &str| ReductionError::InvalidCharacterizations {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", line + 1, reason),
        };
        let mut table = CharacterizationTable::default();
        let mut positions = FocusPositions::default();
        let mut in_geometry = true;
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                in_geometry = false;
                continue;
            }
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            if let Some(iparm) = content.strip_prefix("Instrument parameter file:") {
                table.iparm_file = Some(iparm.trim().to_string());
                continue;
            }
            if let Some(l1) = content.strip_prefix("L1") {
                positions.primary_flight_path = l1
                    .trim()
                    .parse()
                    .map_err(|_| invalid(number, "L1 is not a number"))?;
                continue;
            }
            let values = parse_numbers(content).ok_or_else(|| invalid(number, "not numeric"))?;
            match values.len() {
                3 | 4 if in_geometry => {
                    positions.spectrum_numbers.push(values[0] as i32);
                    positions.l2.push(values[1]);
                    positions.polar.push(values[2]);
                    positions.azimuthal.push(values.get(3).copied().unwrap_or(0.0));
                }
                6.. => table.rows.push(CharacterizationRow {
                    frequency: values[0],
                    wavelength: values[1],
                    bank: values[2] as u32,
                    vanadium: values[3] as i64,
                    container: values[4] as i64,
                    vanadium_background: values[5] as i64,
                    d_min: values.get(6).copied().unwrap_or(0.0),
                    d_max: values.get(7).copied().unwrap_or(0.0),
                }),
                _ => return Err(invalid(number, "unexpected number of columns")),
            }
        }
        if positions.primary_flight_path > 0.0 || !positions.spectrum_numbers.is_empty() {
            table.positions = Some(positions);
        }
        Ok(table)
    }

    /// First row matching a frequency and wavelength.
    pub fn find(&self, frequency: f64, wavelength: f64) -> Option<&CharacterizationRow> {
        self.rows.iter().find(|row| {
            close_enough(row.frequency, frequency) && close_enough(row.wavelength, wavelength)
        })
    }
}

/// Returns true if two values are equal or within 5% relative difference.
fn close_enough(left: f64, right: f64) -> bool {
    if left == right {
        return true;
    }
    let sum = left + right;
    sum != 0.0 && 2.0 * (left - right).abs() / sum.abs() < MATCH_TOLERANCE
}

/// Returns true if a run list means "no run".
///
/// An empty list, or a single entry that is not positive, means no run.
pub fn no_run_specified(runs: &[i64]) -> bool {
    match runs {
        [] => true,
        [run] => *run <= 0,
        _ => false,
    }
}

/// User supplied run lists that override the table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOverrides {
    pub container: Vec<i64>,
    pub vanadium: Vec<i64>,
    pub vanadium_background: Vec<i64>,
}

/// Apply one override to a value from the table.
fn apply_override(table_value: i64, user: &[i64]) -> Vec<i64> {
    match user {
        [] | [0] => vec![table_value],
        [first, ..] if *first < 0 => vec![],
        _ => user.to_vec(),
    }
}

/// Characterization of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct CharacterizationInfo {
    /// Frequency in Hz, if known
    pub frequency: Option<f64>,
    /// Centre wavelength in Angstroms, if known
    pub wavelength: Option<f64>,
    /// Output bank number
    pub bank: u32,
    /// Container runs
    pub container: Vec<i64>,
    /// Vanadium runs
    pub vanadium: Vec<i64>,
    /// Vanadium background runs
    pub vanadium_background: Vec<i64>,
    /// Lower d-spacing bound of focused data, 0 for none
    pub d_min: f64,
    /// Upper d-spacing bound of focused data, 0 for none
    pub d_max: f64,
    /// Instrument parameter file for GSAS output
    pub iparm_file: Option<String>,
}

/// Resolves the characterization of runs from their logs.
#[derive(Clone, Debug)]
pub struct CharacterizationMatcher {
    table: Option<Arc<CharacterizationTable>>,
    overrides: RunOverrides,
    frequency_log_names: Vec<String>,
    wavelength_log_names: Vec<String>,
}

impl CharacterizationMatcher {
    /// Return a new CharacterizationMatcher.
    ///
    /// # Arguments
    ///
    /// * `table`: Optional characterization table
    /// * `overrides`: User supplied run lists
    /// * `frequency_log_names`: Candidate frequency logs, first found wins
    /// * `wavelength_log_names`: Candidate wavelength logs, first found wins
    pub fn new(
        table: Option<Arc<CharacterizationTable>>,
        overrides: RunOverrides,
        frequency_log_names: Vec<String>,
        wavelength_log_names: Vec<String>,
    ) -> Self {
        CharacterizationMatcher {
            table,
            overrides,
            frequency_log_names,
            wavelength_log_names,
        }
    }

    /// Characterization table, if any.
    pub fn table(&self) -> Option<&CharacterizationTable> {
        self.table.as_deref()
    }

    /// Resolve the characterization of a run.
    ///
    /// User overrides take precedence over the table.
    pub fn determine(&self, run: &RunInfo) -> CharacterizationInfo {
        let known = |value: Option<f64>| value.filter(|value| *value != 0.0);
        let frequency = known(run.log_mean(&self.frequency_log_names));
        let wavelength = known(run.log_mean(&self.wavelength_log_names));

        let row = match (self.table(), frequency, wavelength) {
            (Some(table), Some(frequency), Some(wavelength)) => {
                let row = table.find(frequency, wavelength);
                if row.is_none() {
                    event!(
                        Level::WARN,
                        "Failed to find characterization of run {} for frequency {} and wavelength {}",
                        run.run_number,
                        frequency,
                        wavelength
                    );
                }
                row
            }
            (Some(_), _, _) => {
                event!(
                    Level::WARN,
                    "Run {} has no frequency or wavelength, using overrides only",
                    run.run_number
                );
                None
            }
            (None, _, _) => None,
        };

        let row = row.cloned().unwrap_or(CharacterizationRow {
            frequency: frequency.unwrap_or(0.0),
            wavelength: wavelength.unwrap_or(0.0),
            bank: DEFAULT_BANK,
            vanadium: 0,
            container: 0,
            vanadium_background: 0,
            d_min: 0.0,
            d_max: 0.0,
        });
        CharacterizationInfo {
            frequency,
            wavelength,
            bank: row.bank,
            container: apply_override(row.container, &self.overrides.container),
            vanadium: apply_override(row.vanadium, &self.overrides.vanadium),
            vanadium_background: apply_override(
                row.vanadium_background,
                &self.overrides.vanadium_background,
            ),
            d_min: row.d_min,
            d_max: row.d_max,
            iparm_file: self.table().and_then(|table| table.iparm_file.clone()),
        }
    }
}

/// Check that two runs can be summed.
///
/// Runs whose frequency or wavelength differ by more than 5% relative to the left run cannot be
/// added. Unknown values are not compared.
pub fn check_info_match(
    left: &CharacterizationInfo,
    right: &CharacterizationInfo,
) -> Result<(), ReductionError> {
    let mismatch = |left: Option<f64>, right: Option<f64>| match (left, right) {
        (Some(l), Some(r)) if (l - r).abs() / l > MATCH_TOLERANCE => Some((l, r)),
        _ => None,
    };
    if let Some((left, right)) = mismatch(left.frequency, right.frequency) {
        return Err(ReductionError::IncompatibleFrequencies { left, right });
    }
    if let Some((left, right)) = mismatch(left.wavelength, right.wavelength) {
        return Err(ReductionError::IncompatibleWavelengths { left, right });
    }
    Ok(())
}
