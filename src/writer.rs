//! Reference text writer for reduced datasets.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{event, Level};

use crate::error::ReductionError;
use crate::models::OutputFormat;
use crate::operation::{OutputWriter, SaveRequest};
use crate::operations;
use crate::types::{Dataset, DatasetData, Histogram, PropertyValue};

/// File extension of an output format.
pub fn extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Gsas => ".gsa",
        OutputFormat::Fullprof => ".dat",
        OutputFormat::Topas => ".xye",
        OutputFormat::Nexus => ".nxs.json",
        OutputFormat::Pdfgetn => ".getn",
    }
}

/// Path written for an output prefix and format, e.g. `/tmp/PG3_1000.gsa`.
pub fn output_path(prefix: &Path, format: OutputFormat) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(extension(format));
    PathBuf::from(path)
}

/// Writes GSAS, XYE, PDFgetN and JSON dataset files.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextWriter;

impl TextWriter {
    /// Write the data of one format.
    fn write_format(
        &self,
        out: &mut impl Write,
        dataset: &Dataset,
        histogram: &Histogram,
        format: OutputFormat,
        request: &SaveRequest,
    ) -> Result<(), ReductionError> {
        match format {
            OutputFormat::Gsas => write_gsas(out, dataset, histogram, request),
            OutputFormat::Fullprof => write_xye(out, dataset, histogram, "XYDATA\n"),
            OutputFormat::Topas => write_xye(out, dataset, histogram, ""),
            OutputFormat::Pdfgetn => write_pdfgetn(out, dataset, histogram, request.bank),
            OutputFormat::Nexus => {
                serde_json::to_writer_pretty(&mut *out, dataset).map_err(std::io::Error::from)?;
                Ok(writeln!(out)?)
            }
        }
    }
}

impl OutputWriter for TextWriter {
    #[tracing::instrument(level = "DEBUG", skip(self, dataset), fields(name = %dataset.name))]
    fn save(
        &self,
        dataset: &Dataset,
        request: &SaveRequest,
    ) -> Result<Vec<PathBuf>, ReductionError> {
        let binned = match &dataset.data {
            DatasetData::Histogram(_) => dataset.clone(),
            DatasetData::Events(_) => operations::convert_to_histogram(dataset.clone())?,
        };
        let DatasetData::Histogram(histogram) = &binned.data else {
            return Err(ReductionError::IncompatibleDatasets {
                operation: "save",
                reason: "event data could not be histogrammed".to_string(),
            });
        };
        let mut paths = vec![];
        for format in &request.formats {
            let path = output_path(&request.prefix, *format);
            let mut out = BufWriter::new(File::create(&path)?);
            self.write_format(&mut out, dataset, histogram, *format, request)?;
            out.flush()?;
            event!(Level::DEBUG, "Wrote {}", path.display());
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Title line of a dataset.
fn title(dataset: &Dataset) -> String {
    match dataset.run.property("split_label") {
        Some(PropertyValue::Text(label)) => format!("{} {}", dataset.name, label),
        _ => dataset.name.clone(),
    }
}

/// Rows of `(x, y, e)` of one spectrum, with x at the bin centres.
fn rows<'a>(
    histogram: &'a Histogram,
    row: usize,
    centres: &'a [f64],
) -> impl Iterator<Item = (f64, f64, f64)> + 'a {
    centres
        .iter()
        .zip(histogram.counts.row(row))
        .zip(histogram.errors.row(row))
        .map(|((x, y), e)| (*x, *y, *e))
}

/// GSAS FXYE banks. Normalised values are multiplied by the bin width.
fn write_gsas(
    out: &mut impl Write,
    dataset: &Dataset,
    histogram: &Histogram,
    request: &SaveRequest,
) -> Result<(), ReductionError> {
    writeln!(out, "{:<80}", title(dataset))?;
    if let Some(PropertyValue::Text(iparm)) = dataset.run.property("iparm_file") {
        writeln!(out, "{:<80}", format!("Instrument parameter file: {}", iparm))?;
    }
    let centres = histogram.centres();
    let widths = histogram.widths();
    let bins = histogram.number_bins();
    for (row, spectrum_number) in histogram.spectrum_numbers.iter().enumerate() {
        if let Some(geometry) = &dataset.geometry {
            if let Some(polar) = geometry.polar_of(*spectrum_number) {
                writeln!(out, "{:<80}", format!("# Spectrum {} tth {:.3} deg", spectrum_number, polar))?;
            }
        }
        let (first, last) = match (histogram.edges.first(), histogram.edges.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => (0.0, 0.0),
        };
        writeln!(
            out,
            "{:<80}",
            format!(
                "BANK {} {} {} SLOG {:.6} {:.6} 0 0 FXYE",
                request.bank as usize + row,
                bins,
                bins,
                first,
                last
            )
        )?;
        for ((x, y, e), width) in rows(histogram, row, &centres).zip(&widths) {
            let scale = if request.normalized { *width } else { 1.0 };
            writeln!(out, "{:>15.5}{:>15.8}{:>15.8}", x, y * scale, e * scale)?;
        }
    }
    Ok(())
}

/// Three column XYE, one block per spectrum.
fn write_xye(
    out: &mut impl Write,
    dataset: &Dataset,
    histogram: &Histogram,
    preamble: &str,
) -> Result<(), ReductionError> {
    write!(out, "{}", preamble)?;
    let centres = histogram.centres();
    for (row, spectrum_number) in histogram.spectrum_numbers.iter().enumerate() {
        writeln!(out, "' {} spectrum {} {}", title(dataset), spectrum_number, dataset.units)?;
        for (x, y, e) in rows(histogram, row, &centres) {
            writeln!(out, "{:.6} {:.8} {:.8}", x, y, e)?;
        }
    }
    Ok(())
}

/// PDFgetN scan file, one scan per spectrum.
fn write_pdfgetn(
    out: &mut impl Write,
    dataset: &Dataset,
    histogram: &Histogram,
    bank: u32,
) -> Result<(), ReductionError> {
    writeln!(out, "#F {}", title(dataset))?;
    writeln!(out, "#R {}", dataset.run.run_number)?;
    let centres = histogram.centres();
    for (row, spectrum_number) in histogram.spectrum_numbers.iter().enumerate() {
        writeln!(out)?;
        writeln!(out, "#S {} bank {} spectrum {}", row + 1, bank as usize + row, spectrum_number)?;
        writeln!(out, "#N 3")?;
        writeln!(out, "#L X Y E")?;
        for (x, y, e) in rows(histogram, row, &centres) {
            writeln!(out, "{:.6} {:.8} {:.8}", x, y, e)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunInfo, Units};
    use ndarray::array;

    fn dataset() -> Dataset {
        let mut histogram = Histogram::zeros(array![1.0, 2.0, 4.0], vec![1]);
        histogram.counts = array![[3.0, 0.5]];
        histogram.errors = array![[1.0, 0.25]];
        let mut run = RunInfo::new(1000, 0);
        run.set_property("iparm_file", "PG3.iparm");
        Dataset::histogram("PG3_1000", Units::DSpacing, histogram, run)
    }

    fn request(prefix: &Path, formats: Vec<OutputFormat>, normalized: bool) -> SaveRequest {
        SaveRequest {
            prefix: prefix.to_path_buf(),
            formats,
            normalized,
            bank: 1,
        }
    }

    #[test]
    fn test_output_path() {
        let prefix = PathBuf::from("/tmp/PG3_1000");
        assert_eq!(PathBuf::from("/tmp/PG3_1000.gsa"), output_path(&prefix, OutputFormat::Gsas));
        assert_eq!(
            PathBuf::from("/tmp/PG3_1000.nxs.json"),
            output_path(&prefix, OutputFormat::Nexus)
        );
        assert_eq!(
            PathBuf::from("/tmp/PG3_1000.getn"),
            output_path(&prefix, OutputFormat::Pdfgetn)
        );
    }

    #[test]
    fn test_save_all_formats() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("PG3_1000");
        let formats = vec![
            OutputFormat::Gsas,
            OutputFormat::Fullprof,
            OutputFormat::Topas,
            OutputFormat::Nexus,
        ];
        let paths = TextWriter.save(&dataset(), &request(&prefix, formats, false)).unwrap();
        assert_eq!(4, paths.len());
        assert!(paths.iter().all(|path| path.exists()));
        let xye = std::fs::read_to_string(dir.path().join("PG3_1000.xye")).unwrap();
        assert_eq!(
            "' PG3_1000 spectrum 1 DSpacing\n1.500000 3.00000000 1.00000000\n3.000000 0.50000000 0.25000000\n",
            xye
        );
        let dat = std::fs::read_to_string(dir.path().join("PG3_1000.dat")).unwrap();
        assert!(dat.starts_with("XYDATA\n"));
    }

    #[test]
    fn test_gsas_normalized_by_width() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("PG3_1000");
        for normalized in [false, true] {
            let request = request(&prefix, vec![OutputFormat::Gsas], normalized);
            let paths = TextWriter.save(&dataset(), &request).unwrap();
            let text = std::fs::read_to_string(&paths[0]).unwrap();
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!("PG3_1000", lines[0].trim_end());
            assert_eq!("Instrument parameter file: PG3.iparm", lines[1].trim_end());
            assert!(lines[2].starts_with("BANK 1 2 2 SLOG"));
            let last: Vec<f64> = lines[4]
                .split_whitespace()
                .map(|value| value.parse().unwrap())
                .collect();
            // The second bin is 2 wide.
            let expected = if normalized { 1.0 } else { 0.5 };
            assert_eq!(vec![3.0, expected, expected / 2.0], last);
        }
    }

    #[test]
    fn test_nexus_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("PG3_1000");
        let paths = TextWriter
            .save(&dataset(), &request(&prefix, vec![OutputFormat::Nexus], false))
            .unwrap();
        let text = std::fs::read_to_string(&paths[0]).unwrap();
        let loaded: Dataset = serde_json::from_str(&text).unwrap();
        assert_eq!(dataset(), loaded);
    }

    #[test]
    fn test_event_data_is_histogrammed() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("PG3_1000");
        let mut events = crate::test_utils::focused_events(1000, &[1.5, 1.6, 3.0]);
        if let DatasetData::Events(data) = &mut events.data {
            data.edges = Some(array![1.0, 2.0, 4.0]);
        }
        let paths = TextWriter
            .save(&events, &request(&prefix, vec![OutputFormat::Pdfgetn], false))
            .unwrap();
        let text = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(text.starts_with("#F PG3_1000\n#R 1000\n"));
        assert!(text.contains("#S 1 bank 1 spectrum 1"));
        assert!(text.contains("1.500000 2.00000000"));
        assert!(text.contains("3.000000 1.00000000"));
    }

    #[test]
    fn test_missing_directory() {
        let prefix = PathBuf::from("/no/such/directory/PG3_1000");
        let result = TextWriter.save(&dataset(), &request(&prefix, vec![OutputFormat::Topas], false));
        assert!(matches!(result, Err(ReductionError::Io(_))));
    }
}
