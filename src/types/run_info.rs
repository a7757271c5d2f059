//! Run metadata
//!
//! Every dataset carries the metadata of the run it came from: sample logs, the per-pulse proton
//! charge log and named properties written by the reduction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of a named run property.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Flag(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Metadata of a run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RunInfo {
    /// Run number
    pub run_number: i64,
    /// Absolute start time of the run in nanoseconds
    pub start_time_ns: i64,
    /// Sample logs, by name
    pub logs: BTreeMap<String, Vec<f64>>,
    /// Proton charge per pulse, keyed by absolute pulse time in nanoseconds
    pub proton_charge: BTreeMap<i64, f64>,
    /// Properties written during reduction
    pub properties: BTreeMap<String, PropertyValue>,
}

impl RunInfo {
    /// Return a new RunInfo with no logs.
    pub fn new(run_number: i64, start_time_ns: i64) -> Self {
        RunInfo {
            run_number,
            start_time_ns,
            ..Default::default()
        }
    }

    /// Returns the absolute mean of the first log found in `names`.
    ///
    /// Logs that are missing or empty are skipped.
    pub fn log_mean<S: AsRef<str>>(&self, names: &[S]) -> Option<f64> {
        names.iter().find_map(|name| {
            let values = self.logs.get(name.as_ref())?;
            if values.is_empty() {
                return None;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            Some(mean.abs())
        })
    }

    /// Total proton charge over all pulses in the log.
    pub fn integrated_proton_charge(&self) -> f64 {
        self.proton_charge.values().sum()
    }

    /// Keep only pulses with absolute time in `[start_ns, stop_ns)`.
    pub fn restrict_pulses(&mut self, start_ns: i64, stop_ns: i64) {
        self.proton_charge
            .retain(|time, _| *time >= start_ns && *time < stop_ns);
    }

    /// Merge metadata of another dataset into this one.
    ///
    /// The pulse logs are united so that chunks of the same run never count a pulse twice.
    /// Sample logs are concatenated. Existing properties are kept.
    pub fn merge(&mut self, other: &RunInfo) {
        for (time, charge) in &other.proton_charge {
            self.proton_charge.entry(*time).or_insert(*charge);
        }
        if self.run_number != other.run_number {
            for (name, values) in &other.logs {
                self.logs
                    .entry(name.clone())
                    .or_default()
                    .extend(values.iter().copied());
            }
        } else {
            for (name, values) in &other.logs {
                self.logs
                    .entry(name.clone())
                    .or_insert_with(|| values.clone());
            }
        }
        for (name, value) in &other.properties {
            self.properties
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Set a named property.
    pub fn set_property<V: Into<PropertyValue>>(&mut self, name: &str, value: V) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Get a named property.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}
