//! Datasets: the unit of data flowing through the reduction.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::characterization::FocusPositions;
use crate::types::event::EventList;
use crate::types::run_info::RunInfo;

/// Units of the x axis.
#[derive(Clone, Copy, Debug, Deserialize, Display, PartialEq, Serialize)]
pub enum Units {
    /// Time of flight in microseconds
    TimeOfFlight,
    /// d-spacing in Angstroms
    DSpacing,
}

/// Histogrammed data, one row per spectrum.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Histogram {
    /// Bin edges shared by all spectra
    pub edges: Array1<f64>,
    /// Counts, shape (spectra, bins)
    pub counts: Array2<f64>,
    /// Uncertainties, shape (spectra, bins)
    pub errors: Array2<f64>,
    /// Spectrum number of each row
    pub spectrum_numbers: Vec<i32>,
}

impl Histogram {
    /// Return a zero-filled histogram.
    pub fn zeros(edges: Array1<f64>, spectrum_numbers: Vec<i32>) -> Self {
        let bins = edges.len().saturating_sub(1);
        let shape = (spectrum_numbers.len(), bins);
        Histogram {
            edges,
            counts: Array2::zeros(shape),
            errors: Array2::zeros(shape),
            spectrum_numbers,
        }
    }

    /// Number of bins per spectrum.
    pub fn number_bins(&self) -> usize {
        self.counts.ncols()
    }

    /// Returns the index of the bin containing `x`, if any.
    ///
    /// Bins are half open, `[edge_i, edge_i+1)`.
    pub fn find_bin(edges: &[f64], x: f64) -> Option<usize> {
        let (first, last) = (edges.first()?, edges.last()?);
        if edges.len() < 2 || !(x >= *first && x < *last) {
            return None;
        }
        Some(edges.partition_point(|edge| *edge <= x) - 1)
    }

    /// Bin centres.
    pub fn centres(&self) -> Vec<f64> {
        self.edges
            .windows(2)
            .into_iter()
            .map(|pair| 0.5 * (pair[0] + pair[1]))
            .collect()
    }

    /// Bin widths.
    pub fn widths(&self) -> Vec<f64> {
        self.edges
            .windows(2)
            .into_iter()
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

/// Returns true when two sets of bin edges agree to within a relative tolerance of 1e-9.
pub fn edges_match(left: &Array1<f64>, right: &Array1<f64>) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right.iter())
            .all(|(l, r)| (l - r).abs() <= 1e-9 * l.abs().max(r.abs()).max(1.0))
}

/// Event-level data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventData {
    /// Events of each spectrum
    pub spectra: Vec<EventList>,
    /// Bin edges used when histogramming, once the data has been binned
    pub edges: Option<Array1<f64>>,
}

/// Event-level or histogram data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetData {
    Events(EventData),
    Histogram(Histogram),
}

/// A named dataset with its run metadata.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Dataset {
    /// Name of the dataset, e.g. `PG3_1000`
    pub name: String,
    /// Units of the x axis
    pub units: Units,
    /// The data
    pub data: DatasetData,
    /// Run metadata
    pub run: RunInfo,
    /// Focused instrument geometry, if edited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<FocusPositions>,
}

impl Dataset {
    /// Return a new event-level dataset.
    pub fn events(name: &str, units: Units, spectra: Vec<EventList>, run: RunInfo) -> Self {
        Dataset {
            name: name.to_string(),
            units,
            data: DatasetData::Events(EventData {
                spectra,
                edges: None,
            }),
            run,
            geometry: None,
        }
    }

    /// Return a new histogram dataset.
    pub fn histogram(name: &str, units: Units, histogram: Histogram, run: RunInfo) -> Self {
        Dataset {
            name: name.to_string(),
            units,
            data: DatasetData::Histogram(histogram),
            run,
            geometry: None,
        }
    }

    /// Returns true if the dataset holds event-level data.
    pub fn is_event(&self) -> bool {
        matches!(self.data, DatasetData::Events(_))
    }

    /// Number of (possibly weighted) events, or None for histogram data.
    pub fn number_events(&self) -> Option<usize> {
        match &self.data {
            DatasetData::Events(events) => Some(events.spectra.iter().map(EventList::len).sum()),
            DatasetData::Histogram(_) => None,
        }
    }

    /// Number of spectra.
    pub fn number_spectra(&self) -> usize {
        match &self.data {
            DatasetData::Events(events) => events.spectra.len(),
            DatasetData::Histogram(histogram) => histogram.spectrum_numbers.len(),
        }
    }

    /// Spectrum numbers, in storage order.
    pub fn spectrum_numbers(&self) -> Vec<i32> {
        match &self.data {
            DatasetData::Events(events) => events
                .spectra
                .iter()
                .map(|spectrum| spectrum.spectrum_number)
                .collect(),
            DatasetData::Histogram(histogram) => histogram.spectrum_numbers.clone(),
        }
    }

    /// Sum of all event weights or histogram counts.
    pub fn total_counts(&self) -> f64 {
        match &self.data {
            DatasetData::Events(events) => events.spectra.iter().map(EventList::total_weight).sum(),
            DatasetData::Histogram(histogram) => histogram.counts.sum(),
        }
    }

    /// Returns the dataset under a new name.
    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event::Event;
    use ndarray::array;

    #[test]
    fn test_find_bin() {
        let edges = [1.0, 2.0, 4.0, 8.0];
        assert_eq!(None, Histogram::find_bin(&edges, 0.5));
        assert_eq!(Some(0), Histogram::find_bin(&edges, 1.0));
        assert_eq!(Some(1), Histogram::find_bin(&edges, 2.0));
        assert_eq!(Some(2), Histogram::find_bin(&edges, 7.9));
        assert_eq!(None, Histogram::find_bin(&edges, 8.0));
        assert_eq!(None, Histogram::find_bin(&edges, f64::NAN));
        assert_eq!(None, Histogram::find_bin(&[1.0], 1.0));
    }

    #[test]
    fn test_edges_match() {
        let left = array![1.0, 2.0, 3.0];
        assert!(edges_match(&left, &array![1.0, 2.0 + 1e-12, 3.0]));
        assert!(!edges_match(&left, &array![1.0, 2.1, 3.0]));
        assert!(!edges_match(&left, &array![1.0, 2.0]));
    }

    #[test]
    fn test_histogram_geometry() {
        let histogram = Histogram::zeros(array![1.0, 2.0, 4.0], vec![1, 2]);
        assert_eq!((2, 2), histogram.counts.dim());
        assert_eq!(vec![1.5, 3.0], histogram.centres());
        assert_eq!(vec![1.0, 2.0], histogram.widths());
    }

    #[test]
    fn test_event_dataset_counts() {
        let spectra = vec![
            EventList::new(1, vec![Event::new(1.0, 0), Event::new(2.0, 0)]),
            EventList::new(2, vec![Event::weighted(1.0, 0, 2.5, 2.5)]),
        ];
        let dataset = Dataset::events("PG3_1", Units::TimeOfFlight, spectra, RunInfo::new(1, 0));
        assert!(dataset.is_event());
        assert_eq!(Some(3), dataset.number_events());
        assert_eq!(4.5, dataset.total_counts());
        assert_eq!(vec![1, 2], dataset.spectrum_numbers());
    }

    #[test]
    fn test_histogram_dataset_has_no_event_count() {
        let histogram = Histogram::zeros(array![1.0, 2.0], vec![1]);
        let dataset =
            Dataset::histogram("PG3_1", Units::DSpacing, histogram, RunInfo::new(1, 0));
        assert!(!dataset.is_event());
        assert_eq!(None, dataset.number_events());
        assert_eq!(1, dataset.number_spectra());
    }
}
