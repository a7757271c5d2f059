//! Alignment and diffraction focusing.
//!
//! [DiffractionFocus] is a calibration driven focus: time of flight is converted to d-spacing
//! with a per-spectrum DIFC constant and spectra are summed into calibration groups.

use ndarray::Array1;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::characterization::FocusPositions;
use crate::error::ReductionError;
use crate::operation::FocusOperation;
use crate::operations;
use crate::types::{Dataset, DatasetData, Event, EventData, EventList, Units};

/// Calibration of one detector spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationEntry {
    /// Conversion constant, `tof = difc * d`
    pub difc: f64,
    /// Focus group
    pub group: i32,
    /// Whether the spectrum is used
    pub select: bool,
}

/// Calibration table keyed by spectrum number.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Calibration {
    entries: BTreeMap<i32, CalibrationEntry>,
}

impl Calibration {
    /// Parse a calibration file.
    ///
    /// Each line holds `spectrum difc group [select]`. Lines starting with `#` are comments.
    ///
    /// # Arguments
    ///
    /// * `path`: Path of the file, used in errors
    /// * `text`: Contents of the file
    pub fn parse(path: &Path, text: &str) -> Result<Self, ReductionError> {
        let invalid = |line: usize, reason: &str| ReductionError::InvalidCalibration {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", line + 1, reason),
        };
        let mut entries = BTreeMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 3 || columns.len() > 4 {
                return Err(invalid(number, "expected `spectrum difc group [select]`"));
            }
            let spectrum: i32 = columns[0]
                .parse()
                .map_err(|_| invalid(number, "spectrum is not an integer"))?;
            let difc: f64 = columns[1]
                .parse()
                .map_err(|_| invalid(number, "difc is not a number"))?;
            let group: i32 = columns[2]
                .parse()
                .map_err(|_| invalid(number, "group is not an integer"))?;
            let select = match columns.get(3) {
                Some(select) => {
                    select
                        .parse::<i32>()
                        .map_err(|_| invalid(number, "select is not an integer"))?
                        != 0
                }
                None => true,
            };
            if !(difc > 0.0) {
                return Err(invalid(number, "difc must be positive"));
            }
            entries.insert(
                spectrum,
                CalibrationEntry {
                    difc,
                    group,
                    select,
                },
            );
        }
        if entries.is_empty() {
            return Err(ReductionError::InvalidCalibration {
                path: path.to_path_buf(),
                reason: "no spectra".to_string(),
            });
        }
        Ok(Calibration { entries })
    }

    /// Calibration of a spectrum, if it is used.
    pub fn get(&self, spectrum_number: i32) -> Option<&CalibrationEntry> {
        self.entries
            .get(&spectrum_number)
            .filter(|entry| entry.select && entry.group > 0)
    }

    /// Distinct focus groups of selected spectra, ascending.
    pub fn groups(&self) -> Vec<i32> {
        let mut groups: Vec<i32> = self
            .entries
            .values()
            .filter(|entry| entry.select && entry.group > 0)
            .map(|entry| entry.group)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }
}

/// Rebin parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Binning {
    /// Bin width over the range of the data; negative is logarithmic
    Width(f64),
    /// Explicit range; a negative step is logarithmic
    Range { start: f64, step: f64, stop: f64 },
}

impl Binning {
    /// Return a new Binning from rebin parameters, `[width]` or `[start, step, stop]`.
    pub fn new(params: &[f64]) -> Result<Self, ReductionError> {
        let invalid = |reason: &str| ReductionError::InvalidBinning {
            reason: reason.to_string(),
        };
        if params.iter().all(|param| *param == 0.0) {
            return Err(invalid("all parameters are zero"));
        }
        match *params {
            [width] => Ok(Binning::Width(width)),
            [start, step, stop] => {
                if step == 0.0 {
                    Err(invalid("step must not be zero"))
                } else if stop <= start {
                    Err(invalid("stop must be greater than start"))
                } else if step < 0.0 && start <= 0.0 {
                    Err(invalid("logarithmic binning needs a positive start"))
                } else {
                    Ok(Binning::Range { start, step, stop })
                }
            }
            _ => Err(invalid(&format!(
                "expected 1 or 3 parameters, found {}",
                params.len()
            ))),
        }
    }

    /// Bin edges.
    ///
    /// # Arguments
    ///
    /// * `data_range`: Minimum and maximum of the data, used by [Binning::Width]
    pub fn edges(&self, data_range: Option<(f64, f64)>) -> Result<Array1<f64>, ReductionError> {
        let (start, step, stop) = match *self {
            Binning::Range { start, step, stop } => (start, step, stop),
            Binning::Width(width) => {
                let (low, high) = data_range.unwrap_or((width.abs(), width.abs()));
                // The largest value must fall inside the last, half open, bin.
                let high = if high > low {
                    high + width.abs() * 1e-6
                } else {
                    low + width.abs()
                };
                if width < 0.0 && low <= 0.0 {
                    return Err(ReductionError::InvalidBinning {
                        reason: "logarithmic binning needs positive data".to_string(),
                    });
                }
                (low, width, high)
            }
        };
        // Edges within rounding of the stop collapse onto it.
        let last = stop - (stop - start) * 1e-12;
        let mut edges = vec![start];
        loop {
            let edge = if step > 0.0 {
                start + edges.len() as f64 * step
            } else {
                edges[edges.len() - 1] * (1.0 + step.abs())
            };
            if edge >= last {
                break;
            }
            edges.push(edge);
        }
        edges.push(stop);
        Ok(Array1::from(edges))
    }
}

/// Configuration of the focus operation.
#[derive(Clone, Debug)]
pub struct FocusConfig {
    /// Calibration table
    pub calibration: Arc<Calibration>,
    /// Output binning in d-spacing
    pub binning: Binning,
    /// Minimum wavelength, 0 for none
    pub wavelength_min: f64,
    /// Maximum wavelength, 0 for none
    pub wavelength_max: f64,
    /// Width in microseconds of the prompt pulse window, 0 for none
    pub prompt_pulse_width: f64,
    /// Spectrum offset of low resolution spectra
    pub low_res_spectrum_offset: Option<i32>,
    /// Lower d-spacing bound of the output, 0 for none
    pub d_min: f64,
    /// Upper d-spacing bound of the output, 0 for none
    pub d_max: f64,
    /// Event compression tolerance
    pub compress_tolerance: f64,
    /// Geometry of the focused spectra
    pub positions: Option<FocusPositions>,
    /// Keep event data
    pub preserve_events: bool,
}

impl FocusConfig {
    /// Configuration cropped to a d-spacing range. A bound of 0 means none.
    pub fn with_d_range(&self, d_min: f64, d_max: f64) -> Self {
        FocusConfig {
            d_min: d_min.max(0.0),
            d_max: d_max.max(0.0),
            ..self.clone()
        }
    }

    /// Output range in d-spacing, when both bounds are set.
    pub fn d_range(&self) -> Option<(f64, f64)> {
        (self.d_min > 0.0 && self.d_max > self.d_min).then_some((self.d_min, self.d_max))
    }

    /// Returns true if the bin edges depend on the range of the data.
    ///
    /// Such data must stay at event level until every chunk of a run has been summed.
    pub fn bins_from_data(&self) -> bool {
        matches!(self.binning, Binning::Width(_)) && self.d_range().is_none()
    }

    /// Set the bin edges of focused event data. Histogram data is left alone.
    pub fn set_edges(&self, dataset: &mut Dataset) -> Result<(), ReductionError> {
        let DatasetData::Events(events) = &mut dataset.data else {
            return Ok(());
        };
        let edges = match (self.binning, self.d_range()) {
            (Binning::Width(step), Some((start, stop))) => {
                Binning::Range { start, step, stop }.edges(None)?
            }
            (binning, _) => binning.edges(data_range(&events.spectra))?,
        };
        events.edges = Some(edges);
        Ok(())
    }

    fn outside_d_range(&self, d: f64) -> bool {
        (self.d_min > 0.0 && d < self.d_min) || (self.d_max > 0.0 && d >= self.d_max)
    }
}

/// Minimum and maximum x value of some events.
fn data_range(spectra: &[EventList]) -> Option<(f64, f64)> {
    spectra
        .iter()
        .flat_map(|spectrum| spectrum.events.iter().map(|event| event.tof))
        .fold(None, |range, x| match range {
            None => Some((x, x)),
            Some((low, high)) => Some((f64::min(low, x), f64::max(high, x))),
        })
}

/// Calibration driven diffraction focus.
#[derive(Clone, Debug)]
pub struct DiffractionFocus {
    frequency_log_names: Vec<String>,
}

impl DiffractionFocus {
    /// Return a new DiffractionFocus.
    ///
    /// # Arguments
    ///
    /// * `frequency_log_names`: Logs holding the source frequency, used for prompt pulse removal
    pub fn new(frequency_log_names: Vec<String>) -> Self {
        DiffractionFocus {
            frequency_log_names,
        }
    }
}

/// Returns true if an event falls in the prompt pulse window.
fn in_prompt_pulse(tof: f64, period: f64, width: f64) -> bool {
    tof.rem_euclid(period) < width
}

/// Events of each spectrum, with histogram bins turned into weighted events at their centres.
fn raw_events(dataset: &Dataset) -> Vec<EventList> {
    match &dataset.data {
        DatasetData::Events(events) => events.spectra.clone(),
        DatasetData::Histogram(histogram) => {
            let centres = histogram.centres();
            histogram
                .spectrum_numbers
                .iter()
                .enumerate()
                .map(|(row, spectrum_number)| {
                    let events = centres
                        .iter()
                        .enumerate()
                        .filter(|(bin, _)| histogram.counts[[row, *bin]] != 0.0)
                        .map(|(bin, centre)| {
                            let error = histogram.errors[[row, bin]];
                            Event::weighted(*centre, 0, histogram.counts[[row, bin]], error * error)
                        })
                        .collect();
                    EventList::new(*spectrum_number, events)
                })
                .collect()
        }
    }
}

impl FocusOperation for DiffractionFocus {
    fn focus(&self, dataset: &Dataset, config: &FocusConfig) -> Result<Dataset, ReductionError> {
        let groups = config.calibration.groups();
        let mut numbers = groups.clone();
        if let Some(offset) = config.low_res_spectrum_offset {
            numbers.extend(groups.iter().map(|group| group + offset));
        }
        let slot: BTreeMap<i32, usize> = numbers
            .iter()
            .enumerate()
            .map(|(index, number)| (*number, index))
            .collect();
        let mut focused: Vec<EventList> = numbers.iter().map(|n| EventList::empty(*n)).collect();

        let period = dataset
            .run
            .log_mean(&self.frequency_log_names)
            .filter(|frequency| *frequency > 0.0)
            .map(|frequency| 1e6 / frequency);
        let crop = config.wavelength_min > 0.0 || config.wavelength_max > 0.0;

        for spectrum in raw_events(dataset) {
            let Some(entry) = config.calibration.get(spectrum.spectrum_number) else {
                continue;
            };
            let polar = config
                .positions
                .as_ref()
                .and_then(|positions| positions.polar_of(entry.group));
            for event in spectrum.events {
                if let Some(period) = period {
                    if config.prompt_pulse_width > 0.0
                        && in_prompt_pulse(event.tof, period, config.prompt_pulse_width)
                    {
                        continue;
                    }
                }
                let d = event.tof / entry.difc;
                if config.outside_d_range(d) {
                    continue;
                }
                let mut target = entry.group;
                if let (true, Some(polar)) = (crop, polar) {
                    let wavelength = 2.0 * d * (polar.to_radians() / 2.0).sin();
                    let outside = wavelength < config.wavelength_min
                        || (config.wavelength_max > 0.0 && wavelength > config.wavelength_max);
                    if outside {
                        match config.low_res_spectrum_offset {
                            Some(offset) => target = entry.group + offset,
                            None => continue,
                        }
                    }
                }
                focused[slot[&target]].events.push(Event { tof: d, ..event });
            }
        }

        let mut output = Dataset {
            name: dataset.name.clone(),
            units: Units::DSpacing,
            data: DatasetData::Events(EventData {
                spectra: focused,
                edges: None,
            }),
            run: dataset.run.clone(),
            geometry: config.positions.clone(),
        };
        config.set_edges(&mut output)?;
        if (config.preserve_events && dataset.is_event()) || config.bins_from_data() {
            operations::compress(&mut output, config.compress_tolerance);
            Ok(output)
        } else {
            operations::convert_to_histogram(output)
        }
    }
}
