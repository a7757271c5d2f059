//! Arithmetic operations on datasets.
//!
//! Binary operations combine event data at event level where possible and fall back to
//! histograms otherwise. Spectra must line up one to one and histogram bin edges must agree.

use hashbrown::HashSet;
use ndarray::Array2;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::models::PositivityPolicy;
use crate::types::{edges_match, Dataset, DatasetData, Event, EventData, Histogram};

/// Check that two datasets can be combined.
fn check_compatible(
    operation: &'static str,
    left: &Dataset,
    right: &Dataset,
) -> Result<(), ReductionError> {
    let incompatible = |reason: String| ReductionError::IncompatibleDatasets { operation, reason };
    if left.units != right.units {
        return Err(incompatible(format!(
            "units {} and {} differ",
            left.units, right.units
        )));
    }
    if left.spectrum_numbers() != right.spectrum_numbers() {
        return Err(incompatible(format!(
            "{} has {} spectra, {} has {}",
            left.name,
            left.number_spectra(),
            right.name,
            right.number_spectra()
        )));
    }
    Ok(())
}

/// Check that two histograms share bin edges.
fn check_edges(
    operation: &'static str,
    left: &Histogram,
    right: &Histogram,
) -> Result<(), ReductionError> {
    if edges_match(&left.edges, &right.edges) {
        Ok(())
    } else {
        Err(ReductionError::IncompatibleDatasets {
            operation,
            reason: "bin edges differ".to_string(),
        })
    }
}

/// Histogram the events of one spectrum.
fn histogram_row(events: &[Event], edges: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let bins = edges.len().saturating_sub(1);
    let mut counts = vec![0.0; bins];
    let mut errors_squared = vec![0.0; bins];
    for event in events {
        if let Some(bin) = Histogram::find_bin(edges, event.tof) {
            counts[bin] += event.weight;
            errors_squared[bin] += event.error_squared;
        }
    }
    (counts, errors_squared)
}

/// Convert a dataset to a histogram.
///
/// Event data is binned with its own bin edges. Histogram data is returned unchanged.
pub fn convert_to_histogram(dataset: Dataset) -> Result<Dataset, ReductionError> {
    let Dataset {
        name,
        units,
        data,
        run,
        geometry,
    } = dataset;
    let data = match data {
        DatasetData::Histogram(histogram) => DatasetData::Histogram(histogram),
        DatasetData::Events(events) => {
            let Some(edges) = events.edges else {
                return Err(ReductionError::IncompatibleDatasets {
                    operation: "histogram",
                    reason: format!("{} has no bin edges", name),
                });
            };
            let edges_slice = edges.to_vec();
            let rows: Vec<(Vec<f64>, Vec<f64>)> = events
                .spectra
                .par_iter()
                .map(|spectrum| histogram_row(&spectrum.events, &edges_slice))
                .collect();
            let spectrum_numbers = events
                .spectra
                .iter()
                .map(|spectrum| spectrum.spectrum_number)
                .collect();
            let mut histogram = Histogram::zeros(edges, spectrum_numbers);
            for (index, (counts, errors_squared)) in rows.into_iter().enumerate() {
                for (bin, (count, error_squared)) in
                    counts.into_iter().zip(errors_squared).enumerate()
                {
                    histogram.counts[[index, bin]] = count;
                    histogram.errors[[index, bin]] = error_squared.sqrt();
                }
            }
            DatasetData::Histogram(histogram)
        }
    };
    Ok(Dataset {
        name,
        units,
        data,
        run,
        geometry,
    })
}

/// Add two datasets.
///
/// Event lists are concatenated spectrum by spectrum. Histogram counts are summed with errors
/// added in quadrature. If only one side holds events it is histogrammed first. Run metadata is
/// merged, so pulses common to both sides are counted once.
pub fn add(left: Dataset, right: Dataset) -> Result<Dataset, ReductionError> {
    check_compatible("add", &left, &right)?;
    let (left, right) = match (left.is_event(), right.is_event()) {
        (true, false) => (convert_to_histogram(left)?, right),
        (false, true) => (left, convert_to_histogram(right)?),
        _ => (left, right),
    };
    let Dataset {
        name,
        units,
        data,
        mut run,
        geometry,
    } = left;
    run.merge(&right.run);
    let geometry = geometry.or(right.geometry);
    let data = match (data, right.data) {
        (DatasetData::Events(mut left), DatasetData::Events(right)) => {
            for (spectrum, other) in left.spectra.iter_mut().zip(right.spectra) {
                spectrum.events.extend(other.events);
            }
            if left.edges.is_none() {
                left.edges = right.edges;
            }
            DatasetData::Events(left)
        }
        (DatasetData::Histogram(mut left), DatasetData::Histogram(right)) => {
            check_edges("add", &left, &right)?;
            left.counts += &right.counts;
            left.errors = quadrature(&left.errors, &right.errors);
            DatasetData::Histogram(left)
        }
        _ => {
            return Err(ReductionError::IncompatibleDatasets {
                operation: "add",
                reason: "mixed event and histogram data".to_string(),
            })
        }
    };
    Ok(Dataset {
        name,
        units,
        data,
        run,
        geometry,
    })
}

/// Subtract `right` from `left`.
///
/// Event data subtracts at event level by appending the events of `right` with negated weights.
/// The run metadata of `left` is kept.
pub fn subtract(left: Dataset, right: Dataset) -> Result<Dataset, ReductionError> {
    check_compatible("subtract", &left, &right)?;
    if left.is_event() && right.is_event() {
        let mut result = left;
        if let (DatasetData::Events(left), DatasetData::Events(right)) =
            (&mut result.data, right.data)
        {
            for (spectrum, other) in left.spectra.iter_mut().zip(right.spectra) {
                spectrum.events.extend(other.events.into_iter().map(|event| Event {
                    weight: -event.weight,
                    ..event
                }));
            }
            if left.edges.is_none() {
                left.edges = right.edges;
            }
        }
        return Ok(result);
    }
    let mut result = convert_to_histogram(left)?;
    let right = convert_to_histogram(right)?;
    if let (DatasetData::Histogram(left), DatasetData::Histogram(right)) =
        (&mut result.data, &right.data)
    {
        check_edges("subtract", left, right)?;
        left.counts -= &right.counts;
        left.errors = quadrature(&left.errors, &right.errors);
    }
    Ok(result)
}

/// Divide `left` by `right`.
///
/// Both sides are histogrammed. Relative errors add in quadrature. Bins with a zero divisor are
/// set to zero with zero error. The run metadata of `left` is kept.
pub fn divide(left: Dataset, right: Dataset) -> Result<Dataset, ReductionError> {
    check_compatible("divide", &left, &right)?;
    let mut result = convert_to_histogram(left)?;
    let right = convert_to_histogram(right)?;
    if let (DatasetData::Histogram(left), DatasetData::Histogram(right)) =
        (&mut result.data, &right.data)
    {
        check_edges("divide", left, right)?;
        ndarray::Zip::from(&mut left.counts)
            .and(&mut left.errors)
            .and(&right.counts)
            .and(&right.errors)
            .for_each(|count, error, divisor, divisor_error| {
                if *divisor == 0.0 {
                    *count = 0.0;
                    *error = 0.0;
                } else {
                    let quotient = *count / divisor;
                    *error = ((*error / divisor).powi(2)
                        + (quotient * divisor_error / divisor).powi(2))
                    .sqrt();
                    *count = quotient;
                }
            });
    }
    Ok(result)
}

fn quadrature(left: &Array2<f64>, right: &Array2<f64>) -> Array2<f64> {
    ndarray::Zip::from(left)
        .and(right)
        .map_collect(|l, r| (l * l + r * r).sqrt())
}

/// Deduplicate the events of one spectrum.
fn compress_events(mut events: Vec<Event>, tolerance: f64) -> Vec<Event> {
    events.sort_by(|a, b| a.tof.total_cmp(&b.tof));
    let bucket = |tof: f64| {
        if tolerance > 0.0 {
            (tof / tolerance).floor()
        } else {
            tof
        }
    };
    let mut compressed = Vec::with_capacity(events.len());
    let mut start = 0;
    while start < events.len() {
        let key = bucket(events[start].tof);
        let end = start
            + events[start..]
                .iter()
                .take_while(|event| bucket(event.tof) == key)
                .count()
                .max(1);
        let group = &events[start..end];
        if let [single] = group {
            compressed.push(*single);
        } else {
            let weight: f64 = group.iter().map(|event| event.weight).sum();
            let error_squared = group.iter().map(|event| event.error_squared).sum();
            let (low, high) = (group[0].tof, group[group.len() - 1].tof);
            let mean = if weight != 0.0 {
                group.iter().map(|event| event.weight * event.tof).sum::<f64>() / weight
            } else {
                group.iter().map(|event| event.tof).sum::<f64>() / group.len() as f64
            };
            let pulse_time_ns = group
                .iter()
                .map(|event| event.pulse_time_ns)
                .min()
                .unwrap_or_default();
            compressed.push(Event {
                tof: mean.clamp(low, high),
                pulse_time_ns,
                weight,
                error_squared,
            });
        }
        start = end;
    }
    compressed
}

/// Deduplicate events.
///
/// Events of a spectrum falling in the same `floor(tof / tolerance)` bucket are replaced by a
/// single weighted event. A tolerance of 0 merges only identical times of flight. Histogram
/// data is left unchanged.
///
/// # Arguments
///
/// * `dataset`: Dataset to compress in place
/// * `tolerance`: Bucket width, non-negative
pub fn compress(dataset: &mut Dataset, tolerance: f64) {
    if let DatasetData::Events(events) = &mut dataset.data {
        let before: usize = events.spectra.iter().map(|spectrum| spectrum.len()).sum();
        events.spectra.par_iter_mut().for_each(|spectrum| {
            let taken = std::mem::take(&mut spectrum.events);
            spectrum.events = compress_events(taken, tolerance);
        });
        let after: usize = events.spectra.iter().map(|spectrum| spectrum.len()).sum();
        event!(
            Level::TRACE,
            "Compressed {} from {} to {} events",
            dataset.name,
            before,
            after
        );
    }
}

/// Multiply a dataset by a constant.
pub fn scale(dataset: &mut Dataset, factor: f64) {
    match &mut dataset.data {
        DatasetData::Events(events) => {
            for event in events
                .spectra
                .iter_mut()
                .flat_map(|spectrum| spectrum.events.iter_mut())
            {
                event.weight *= factor;
                event.error_squared *= factor * factor;
            }
        }
        DatasetData::Histogram(histogram) => {
            histogram.counts *= factor;
            histogram.errors *= factor.abs();
        }
    }
}

/// Remove negative values according to a policy.
///
/// Policies other than [PositivityPolicy::None] histogram the dataset.
pub fn reset_negatives(
    dataset: Dataset,
    policy: PositivityPolicy,
) -> Result<Dataset, ReductionError> {
    if policy == PositivityPolicy::None {
        return Ok(dataset);
    }
    let mut dataset = convert_to_histogram(dataset)?;
    if let DatasetData::Histogram(histogram) = &mut dataset.data {
        match policy {
            PositivityPolicy::None => {}
            PositivityPolicy::ResetToZero => {
                histogram.counts.mapv_inplace(|count| count.max(0.0));
            }
            PositivityPolicy::AddMinimum => {
                let minimum = *histogram.counts.min_skipnan();
                if minimum < 0.0 {
                    let shift = minimum.abs();
                    event!(Level::DEBUG, "Shifting {} by {}", dataset.name, shift);
                    histogram.counts.mapv_inplace(|count| count + shift);
                }
            }
        }
    }
    Ok(dataset)
}

/// Divide a dataset by its integrated proton charge.
///
/// On success the dataset is marked as normalised. A dataset without charge is left unchanged.
pub fn normalise_by_current(dataset: &mut Dataset) -> Result<(), ReductionError> {
    let charge = dataset.run.integrated_proton_charge();
    if !(charge > 0.0) {
        return Err(ReductionError::NoProtonCharge {
            name: dataset.name.clone(),
        });
    }
    scale(dataset, 1.0 / charge);
    dataset.run.set_property("gsas_monitor", 1);
    dataset.run.set_property("normalized_by_current", true);
    Ok(())
}

/// How to reset uncertainties.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Uncertainties {
    /// Set errors to zero
    Zero,
    /// Set errors to the square root of the absolute counts
    Sqrt,
}

/// Reset the uncertainties of a dataset.
pub fn set_uncertainties(dataset: &mut Dataset, mode: Uncertainties) {
    match &mut dataset.data {
        DatasetData::Events(EventData { spectra, .. }) => {
            for event in spectra
                .iter_mut()
                .flat_map(|spectrum| spectrum.events.iter_mut())
            {
                event.error_squared = match mode {
                    Uncertainties::Zero => 0.0,
                    Uncertainties::Sqrt => event.weight.abs(),
                };
            }
        }
        DatasetData::Histogram(histogram) => match mode {
            Uncertainties::Zero => histogram.errors.fill(0.0),
            Uncertainties::Sqrt => {
                histogram.errors = histogram.counts.mapv(|count| count.abs().sqrt())
            }
        },
    }
}

/// Drop pulses with low proton charge.
///
/// Pulses whose charge is below `cutoff_percent` of the mean pulse charge are removed from the
/// pulse log, together with their events. Returns the number of pulses removed.
pub fn filter_bad_pulses(dataset: &mut Dataset, cutoff_percent: f64) -> usize {
    let pulses = &dataset.run.proton_charge;
    if pulses.is_empty() || cutoff_percent <= 0.0 {
        return 0;
    }
    let mean = pulses.values().sum::<f64>() / pulses.len() as f64;
    let threshold = mean * cutoff_percent / 100.0;
    let bad: HashSet<i64> = pulses
        .iter()
        .filter(|(_, charge)| **charge < threshold)
        .map(|(time, _)| *time)
        .collect();
    if bad.is_empty() {
        return 0;
    }
    dataset.run.proton_charge.retain(|time, _| !bad.contains(time));
    if let DatasetData::Events(events) = &mut dataset.data {
        for spectrum in events.spectra.iter_mut() {
            spectrum
                .events
                .retain(|event| !bad.contains(&event.pulse_time_ns));
        }
    }
    event!(
        Level::DEBUG,
        "Removed {} bad pulses from {}",
        bad.len(),
        dataset.name
    );
    bad.len()
}
