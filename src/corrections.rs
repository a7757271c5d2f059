//! Reference corrections for vanadium and container datasets.

use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use std::f64::consts::PI;
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::operation::Corrections;
use crate::operations;
use crate::types::{Dataset, DatasetData, Histogram};

/// Vanadium number density in atoms per cubic Angstrom.
pub const VANADIUM_NUMBER_DENSITY: f64 = 0.0721;

/// Vanadium total scattering plus absorption cross section at 1.8 Angstrom, in barns.
const VANADIUM_CROSS_SECTION: f64 = 5.10 + 5.08;

/// Known vanadium Bragg peak positions in d-spacing.
pub const VANADIUM_PEAKS: [f64; 17] = [
    0.5044, 0.5191, 0.5350, 0.5526, 0.5936, 0.6178, 0.6453, 0.6768, 0.7134, 0.7566, 0.8089,
    0.8737, 0.9571, 1.0701, 1.2356, 1.5133, 2.1401,
];

/// Butterworth low-pass filter parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothParams {
    /// Cutoff frequency index
    pub cutoff: usize,
    /// Filter order
    pub order: u32,
}

impl SmoothParams {
    /// Parse `"cutoff,order"`. Returns None for an empty string.
    pub fn parse(params: &str) -> Result<Option<Self>, ReductionError> {
        let params = params.trim();
        if params.is_empty() {
            return Ok(None);
        }
        let invalid = || ReductionError::InvalidSmoothParams {
            params: params.to_string(),
        };
        let (cutoff, order) = params.split_once(',').ok_or_else(invalid)?;
        let cutoff: usize = cutoff.trim().parse().map_err(|_| invalid())?;
        let order: u32 = order.trim().parse().map_err(|_| invalid())?;
        if cutoff == 0 || order == 0 {
            return Err(invalid());
        }
        Ok(Some(SmoothParams { cutoff, order }))
    }

    /// Filter gain at frequency index `k`.
    fn gain(&self, k: f64) -> f64 {
        1.0 / (1.0 + (k / self.cutoff as f64).powi(2 * self.order as i32))
    }
}

/// Smooth one row with a Butterworth low-pass filter.
///
/// The row is mirrored before transforming so that both ends join smoothly.
fn butterworth(row: &mut [f64], params: SmoothParams) -> Result<(), ReductionError> {
    let n = row.len();
    if n < 2 {
        return Ok(());
    }
    let len = 2 * n;
    let mut planner = RealFftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(len);
    let inverse = planner.plan_fft_inverse(len);

    let mut input: Vec<f64> = row.iter().chain(row.iter().rev()).copied().collect();
    let mut spectrum = forward.make_output_vec();
    forward.process(&mut input, &mut spectrum)?;
    for (k, value) in spectrum.iter_mut().enumerate() {
        // The mirrored row has twice the frequency resolution.
        *value *= params.gain(k as f64 / 2.0);
    }
    // Real output needs purely real DC and Nyquist terms.
    spectrum[0] = Complex::new(spectrum[0].re, 0.0);
    let nyquist = len / 2;
    spectrum[nyquist] = Complex::new(spectrum[nyquist].re, 0.0);

    let mut output = inverse.make_output_vec();
    inverse.process(&mut spectrum, &mut output)?;
    let scale = 1.0 / len as f64;
    for (value, smoothed) in row.iter_mut().zip(output) {
        *value = smoothed * scale;
    }
    Ok(())
}

/// Replace the bins around `bin` with a straight line between its neighbours.
fn strip_window(histogram: &mut Histogram, centres: &[f64], bin: usize, fwhm: usize) {
    let bins = centres.len();
    let low = bin.saturating_sub(fwhm);
    let high = (bin + fwhm).min(bins - 1);
    let left = low.saturating_sub(1);
    let right = (high + 1).min(bins - 1);
    if right <= left {
        return;
    }
    let width = centres[right] - centres[left];
    for mut row in histogram.counts.rows_mut() {
        let (y0, y1) = (row[left], row[right]);
        for index in low.max(left + 1)..=high.min(right - 1) {
            let t = (centres[index] - centres[left]) / width;
            row[index] = y0 + t * (y1 - y0);
        }
    }
    for mut row in histogram.errors.rows_mut() {
        let (e0, e1) = (row[left], row[right]);
        for index in low.max(left + 1)..=high.min(right - 1) {
            let t = (centres[index] - centres[left]) / width;
            row[index] = e0 + t * (e1 - e0);
        }
    }
}

/// Corrections with simple closed-form models.
///
/// Absorption uses a wavelength independent cylinder transmission, peak stripping interpolates
/// across known vanadium peaks and smoothing is a Butterworth low-pass filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceCorrections;

impl Corrections for ReferenceCorrections {
    fn absorption(&self, mut dataset: Dataset, radius: f64) -> Result<Dataset, ReductionError> {
        dataset.run.set_property("sample_material", "V");
        dataset
            .run
            .set_property("sample_number_density", VANADIUM_NUMBER_DENSITY);
        dataset.run.set_property("cylinder_radius", radius);
        // Attenuation in cm^-1, over the mean chord of a circle.
        let attenuation = VANADIUM_NUMBER_DENSITY * VANADIUM_CROSS_SECTION;
        let transmission = (-attenuation * PI * radius / 2.0).exp();
        event!(
            Level::DEBUG,
            "Correcting {} for absorption, transmission {:.4}",
            dataset.name,
            transmission
        );
        operations::scale(&mut dataset, 1.0 / transmission);
        Ok(dataset)
    }

    fn strip_vanadium_peaks(
        &self,
        dataset: Dataset,
        fwhm: u32,
        tolerance: f64,
    ) -> Result<Dataset, ReductionError> {
        if tolerance < 0.0 {
            return Ok(dataset);
        }
        let mut dataset = operations::convert_to_histogram(dataset)?;
        let name = dataset.name.clone();
        if let DatasetData::Histogram(histogram) = &mut dataset.data {
            if histogram.number_bins() == 0 {
                return Ok(dataset);
            }
            let centres = histogram.centres();
            let edges = histogram.edges.to_vec();
            let mut stripped = 0;
            for peak in VANADIUM_PEAKS {
                let Some(bin) = Histogram::find_bin(&edges, peak) else {
                    continue;
                };
                if (centres[bin] - peak).abs() / peak > tolerance {
                    continue;
                }
                strip_window(histogram, &centres, bin, fwhm as usize);
                stripped += 1;
            }
            event!(Level::DEBUG, "Stripped {} vanadium peaks from {}", stripped, name);
        }
        Ok(dataset)
    }

    fn smooth(&self, dataset: Dataset, params: &str) -> Result<Dataset, ReductionError> {
        let Some(params) = SmoothParams::parse(params)? else {
            return Ok(dataset);
        };
        let mut dataset = operations::convert_to_histogram(dataset)?;
        if let DatasetData::Histogram(histogram) = &mut dataset.data {
            for mut row in histogram.counts.rows_mut() {
                let mut values = row.to_vec();
                butterworth(&mut values, params)?;
                for (count, value) in row.iter_mut().zip(values) {
                    *count = value;
                }
            }
        }
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PropertyValue, RunInfo, Units};
    use ndarray::{Array1, Array2};

    /// Histogram in d-spacing with the given counts on edges `start, start + step, ...`.
    fn focused(start: f64, step: f64, counts: Vec<f64>) -> Dataset {
        let bins = counts.len();
        let edges = Array1::from_iter((0..=bins).map(|i| start + step * i as f64));
        let mut histogram = Histogram::zeros(edges, vec![1]);
        histogram.counts = Array2::from_shape_vec((1, bins), counts).unwrap();
        histogram.errors = histogram.counts.mapv(|count: f64| count.abs().sqrt());
        Dataset::histogram("PG3_2000", Units::DSpacing, histogram, RunInfo::new(2000, 0))
    }

    fn counts(dataset: &Dataset) -> Vec<f64> {
        match &dataset.data {
            DatasetData::Histogram(histogram) => histogram.counts.iter().copied().collect(),
            DatasetData::Events(_) => panic!("expected histogram"),
        }
    }

    #[test]
    fn test_smooth_params() {
        assert_eq!(
            Some(SmoothParams {
                cutoff: 20,
                order: 2
            }),
            SmoothParams::parse("20,2").unwrap()
        );
        assert_eq!(None, SmoothParams::parse("").unwrap());
        for params in ["20", "a,2", "0,2", "20,0", "20;2"] {
            assert!(matches!(
                SmoothParams::parse(params),
                Err(ReductionError::InvalidSmoothParams { .. })
            ));
        }
    }

    #[test]
    fn test_absorption() {
        let dataset = focused(1.0, 1.0, vec![1.0, 2.0]);
        let corrected = ReferenceCorrections.absorption(dataset, 0.3175).unwrap();
        assert_eq!(
            Some(&PropertyValue::from("V")),
            corrected.run.property("sample_material")
        );
        assert_eq!(
            Some(&PropertyValue::Float(0.0721)),
            corrected.run.property("sample_number_density")
        );
        assert_eq!(
            Some(&PropertyValue::Float(0.3175)),
            corrected.run.property("cylinder_radius")
        );
        let values = counts(&corrected);
        assert!(values[0] > 1.0);
        assert!((values[1] / values[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_smooth_constant_is_unchanged() {
        let dataset = focused(0.5, 0.01, vec![3.0; 64]);
        let smoothed = ReferenceCorrections.smooth(dataset, "20,2").unwrap();
        for value in counts(&smoothed) {
            assert!((value - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_smooth_removes_noise() {
        let noisy: Vec<f64> = (0..128)
            .map(|i| 10.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let dataset = focused(0.5, 0.01, noisy);
        let smoothed = ReferenceCorrections.smooth(dataset, "20,2").unwrap();
        let values = counts(&smoothed);
        let deviation: f64 = values.iter().map(|value| (value - 10.0).powi(2)).sum();
        assert!(deviation < 0.1 * 128.0);
        assert!((values.iter().sum::<f64>() - 1280.0).abs() < 1e-6);
    }

    #[test]
    fn test_smooth_empty_params_is_off() {
        let dataset = focused(0.5, 0.01, vec![1.0, 5.0, 1.0]);
        let smoothed = ReferenceCorrections.smooth(dataset.clone(), "").unwrap();
        assert_eq!(dataset, smoothed);
    }

    #[test]
    fn test_smooth_invalid_params() {
        let dataset = focused(0.5, 0.01, vec![1.0]);
        let result = ReferenceCorrections.smooth(dataset, "twenty,2");
        assert!(matches!(
            result,
            Err(ReductionError::InvalidSmoothParams { .. })
        ));
    }

    #[test]
    fn test_strip_peak() {
        // Bins of 0.1 from 2.0, with a peak at 2.1401 in bin 1.
        let dataset = focused(2.0, 0.1, vec![1.0, 9.0, 3.0, 4.0, 5.0]);
        let stripped = ReferenceCorrections
            .strip_vanadium_peaks(dataset, 0, 0.05)
            .unwrap();
        let values = counts(&stripped);
        assert!((values[1] - 2.0).abs() < 1e-9);
        assert_eq!(vec![1.0, 3.0, 4.0, 5.0], vec![values[0], values[2], values[3], values[4]]);
    }

    #[test]
    fn test_strip_window() {
        let dataset = focused(2.0, 0.1, vec![1.0, 9.0, 9.0, 9.0, 5.0]);
        let stripped = ReferenceCorrections
            .strip_vanadium_peaks(dataset, 1, 0.05)
            .unwrap();
        // The window reaches the first bin, so bins 1 and 2 lie between bins 0 and 3.
        let values = counts(&stripped);
        assert_eq!(1.0, values[0]);
        assert!((values[1] - (1.0 + (9.0 - 1.0) / 3.0)).abs() < 1e-9);
        assert!((values[2] - (1.0 + 2.0 * (9.0 - 1.0) / 3.0)).abs() < 1e-9);
        assert_eq!(9.0, values[3]);
        assert_eq!(5.0, values[4]);
    }

    #[test]
    fn test_strip_off() {
        let dataset = focused(2.0, 0.1, vec![1.0, 9.0, 3.0]);
        let stripped = ReferenceCorrections
            .strip_vanadium_peaks(dataset.clone(), 7, -1.0)
            .unwrap();
        assert_eq!(dataset, stripped);
    }

    #[test]
    fn test_strip_out_of_tolerance() {
        // Every peak in range is more than 5% away from the centre of the only bin.
        let dataset = focused(1.0, 2.0, vec![4.0]);
        let stripped = ReferenceCorrections
            .strip_vanadium_peaks(dataset.clone(), 7, 0.05)
            .unwrap();
        assert_eq!(counts(&dataset), counts(&stripped));
    }
}
