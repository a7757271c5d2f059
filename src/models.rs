//! Reduction request and associated functions and methods

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::Display;
use validator::{Validate, ValidationError};

use crate::error::ReductionError;
use crate::splitter::{SplitInformationTable, SplitterTable};

/// Default event deduplication tolerance in microseconds.
pub const DEFAULT_COMPRESS_TOLERANCE: f64 = 0.01;

/// Policy for removing negative intensities before writing output
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositivityPolicy {
    /// Leave the data untouched
    #[default]
    None,
    /// Clamp negative values to zero
    ResetToZero,
    /// Shift the whole dataset by the magnitude of its most negative value
    AddMinimum,
}

/// Output file format
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// GSAS (`.gsa`)
    Gsas,
    /// FullProf XYE (`.dat`)
    Fullprof,
    /// TOPAS XYE (`.xye`)
    Topas,
    /// Dataset dump (`.nxs.json`)
    Nexus,
    /// PDFgetN (`.getn`), written after focusing
    Pdfgetn,
}

fn default_instrument() -> String {
    "PG3".to_string()
}

fn default_extension() -> String {
    "_event.json".to_string()
}

fn default_runs() -> Vec<i64> {
    vec![0]
}

fn default_true() -> bool {
    true
}

fn default_binning() -> Vec<f64> {
    vec![0.0, 0.0, 0.0]
}

fn default_max_chunk_size() -> String {
    "0".to_string()
}

fn default_vanadium_fwhm() -> u32 {
    7
}

fn default_vanadium_peak_tol() -> f64 {
    0.05
}

fn default_vanadium_smooth_params() -> String {
    "20,2".to_string()
}

fn default_vanadium_radius() -> f64 {
    0.3175
}

fn default_filter_bad_pulses() -> f64 {
    95.0
}

fn default_scale_data() -> f64 {
    1.0
}

fn default_save_as() -> Vec<OutputFormat> {
    vec![OutputFormat::Gsas]
}

fn default_low_resolution_spectra_offset() -> i32 {
    -1
}

fn default_compress_tof_tolerance() -> f64 {
    DEFAULT_COMPRESS_TOLERANCE
}

fn default_frequency_log_names() -> Vec<String> {
    vec![
        "SpeedRequest1".to_string(),
        "Speed1".to_string(),
        "frequency".to_string(),
    ]
}

fn default_wavelength_log_names() -> Vec<String> {
    vec!["LambdaRequest".to_string(), "lambda".to_string()]
}

/// Description of a reduction job
#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_request"))]
pub struct ReductionRequest {
    /// Instrument short name, used to build file and dataset names
    #[serde(default = "default_instrument")]
    #[validate(length(min = 1, message = "instrument must not be empty"))]
    pub instrument: String,
    /// Sample run numbers, or 0 for only vanadium and/or background
    #[serde(default = "default_runs")]
    pub run_number: Vec<i64>,
    /// Raw file extension
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Keep event-level data through focusing
    #[serde(default = "default_true")]
    pub preserve_events: bool,
    /// Sum the sample runs before reduction
    #[serde(default)]
    pub sum: bool,
    /// Policy for removing negative values
    #[serde(default)]
    pub push_data_positive: PositivityPolicy,
    /// Container run override; -1 turns the correction off
    #[serde(default = "default_runs")]
    pub background_number: Vec<i64>,
    /// Vanadium run override; -1 turns the correction off
    #[serde(default = "default_runs")]
    pub vanadium_number: Vec<i64>,
    /// Vanadium background run override; -1 turns the correction off
    #[serde(default = "default_runs")]
    pub vanadium_background_number: Vec<i64>,
    /// Calibration file
    pub calibration_file: PathBuf,
    /// Characterization runs file
    #[serde(default)]
    pub characterization_file: Option<PathBuf>,
    /// Crop the data at this minimum wavelength
    #[serde(default)]
    pub crop_wavelength_min: f64,
    /// Crop the data at this maximum wavelength
    #[serde(default)]
    pub crop_wavelength_max: f64,
    /// Width in microseconds of events near the prompt pulse to remove; 0 disables
    #[serde(default)]
    pub remove_prompt_pulse_width: f64,
    /// Maximum size of file to read in one chunk, e.g. "1.5 GB"; 0 reads the whole file
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: String,
    /// Apply the sample time filter wall to characterization runs
    #[serde(default)]
    pub filter_characterizations: bool,
    /// Rebin parameters, `[width]` or `[start, step, stop]`; negative step is logarithmic
    #[serde(default = "default_binning")]
    #[validate(custom = "validate_binning")]
    pub binning: Vec<f64>,
    /// Strip vanadium peaks
    #[serde(default = "default_true")]
    pub strip_vanadium_peaks: bool,
    /// Vanadium peak width in bins
    #[serde(default = "default_vanadium_fwhm")]
    pub vanadium_fwhm: u32,
    /// Relative tolerance on vanadium peak positions; negative turns stripping off
    #[serde(default = "default_vanadium_peak_tol")]
    pub vanadium_peak_tol: f64,
    /// Butterworth parameters for vanadium smoothing
    #[serde(default = "default_vanadium_smooth_params")]
    pub vanadium_smooth_params: String,
    /// Vanadium cylinder radius for the absorption correction
    #[serde(default = "default_vanadium_radius")]
    pub vanadium_radius: f64,
    /// Butterworth parameters for background smoothing; empty is off
    #[serde(default)]
    pub background_smooth_params: String,
    /// Filter out pulses with charge below this percentage of the average; 0 disables
    #[serde(default = "default_filter_bad_pulses")]
    pub filter_bad_pulses: f64,
    /// Constant to multiply the data by before writing out
    #[serde(default = "default_scale_data")]
    pub scale_data: f64,
    /// Output file types
    #[serde(default = "default_save_as")]
    #[validate(length(min = 1, message = "save_as must not be empty"))]
    pub save_as: Vec<OutputFormat>,
    /// Overrides the default output file name prefix
    #[serde(default)]
    pub output_file_prefix: String,
    /// Output directory
    pub output_directory: PathBuf,
    /// Event splitters
    #[serde(default)]
    pub splitters: Option<SplitterTable>,
    /// Labels for the event splitters
    #[serde(default)]
    pub split_information: Option<SplitInformationTable>,
    /// Spectrum offset of low resolution data; negative disables
    #[serde(default = "default_low_resolution_spectra_offset")]
    pub low_resolution_spectra_offset: i32,
    /// Normalise by the integrated proton charge
    #[serde(default = "default_true")]
    pub normalize_by_current: bool,
    /// Tolerance for event compression; negative falls back to the default
    #[serde(default = "default_compress_tof_tolerance")]
    pub compress_tof_tolerance: f64,
    /// Candidate log names for frequency
    #[serde(default = "default_frequency_log_names")]
    pub frequency_log_names: Vec<String>,
    /// Candidate log names for wavelength
    #[serde(default = "default_wavelength_log_names")]
    pub wavelength_log_names: Vec<String>,
}

impl ReductionRequest {
    /// Parse and validate a request from JSON.
    pub fn from_json(json: &str) -> Result<Self, ReductionError> {
        let request: ReductionRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// Compression tolerance, falling back to the default when negative.
    pub fn compress_tolerance(&self) -> f64 {
        if self.compress_tof_tolerance < 0.0 {
            DEFAULT_COMPRESS_TOLERANCE
        } else {
            self.compress_tof_tolerance
        }
    }

    /// Low resolution spectrum offset, if enabled.
    pub fn low_res_offset(&self) -> Option<i32> {
        (self.low_resolution_spectra_offset >= 0).then_some(self.low_resolution_spectra_offset)
    }

    /// Maximum chunk size in bytes; 0 means the whole file.
    pub fn max_chunk_bytes(&self) -> Result<u64, ReductionError> {
        let bytes = byte_unit::Byte::parse_str(self.max_chunk_size.trim(), true)?;
        Ok(bytes.as_u64())
    }

    /// Expand `~` in all paths of the request.
    pub fn expand_paths(&mut self) {
        self.calibration_file = expand(&self.calibration_file);
        self.characterization_file = self.characterization_file.as_ref().map(|p| expand(p));
        self.output_directory = expand(&self.output_directory);
    }

    /// Check that the output directory exists.
    pub fn check_output_directory(&self) -> Result<(), ReductionError> {
        if self.output_directory.is_dir() {
            Ok(())
        } else {
            Err(ReductionError::OutputDirectoryMissing {
                path: self.output_directory.clone(),
            })
        }
    }
}

/// Expand a leading `~` in a path.
fn expand(path: &std::path::Path) -> PathBuf {
    match path.to_str() {
        Some(text) if text.starts_with('~') => {
            expanduser::expanduser(text).unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Validate rebin parameters
fn validate_binning(binning: &[f64]) -> Result<(), ValidationError> {
    if binning.len() != 1 && binning.len() != 3 {
        let mut error =
            ValidationError::new("Can only specify (width) or (start,width,stop) for binning");
        error.add_param("length".into(), &binning.len());
        return Err(error);
    }
    if binning.iter().all(|param| *param == 0.0) {
        return Err(ValidationError::new("Failed to specify the binning"));
    }
    Ok(())
}

/// Validate reduction request
fn validate_request(request: &ReductionRequest) -> Result<(), ValidationError> {
    // Validation of scalar fields and combinations of fields.
    if !(request.scale_data > 0.0) {
        let mut error = ValidationError::new("scale_data must be greater than 0");
        error.add_param("scale_data".into(), &request.scale_data);
        return Err(error);
    }
    if request.remove_prompt_pulse_width < 0.0 {
        return Err(ValidationError::new(
            "remove_prompt_pulse_width must not be negative",
        ));
    }
    if !(request.vanadium_radius > 0.0) {
        return Err(ValidationError::new(
            "vanadium_radius must be greater than 0",
        ));
    }
    if request.crop_wavelength_max > 0.0
        && request.crop_wavelength_max <= request.crop_wavelength_min
    {
        let mut error = ValidationError::new(
            "crop_wavelength_max must be greater than crop_wavelength_min",
        );
        error.add_param("min".into(), &request.crop_wavelength_min);
        error.add_param("max".into(), &request.crop_wavelength_max);
        return Err(error);
    }
    if request.run_number.iter().any(|run| *run < 0) {
        return Err(ValidationError::new("run_number must not be negative"));
    }
    Ok(())
}
