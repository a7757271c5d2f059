//! Neutron events and event lists.

use serde::{Deserialize, Serialize};

/// A single (possibly weighted) detector event.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event {
    /// Time of flight in microseconds, or d-spacing once focused
    pub tof: f64,
    /// Absolute pulse time in nanoseconds
    pub pulse_time_ns: i64,
    /// Event weight
    pub weight: f64,
    /// Squared uncertainty of the weight
    pub error_squared: f64,
}

impl Event {
    /// Return a new raw (unit weight) event.
    pub fn new(tof: f64, pulse_time_ns: i64) -> Self {
        Event {
            tof,
            pulse_time_ns,
            weight: 1.0,
            error_squared: 1.0,
        }
    }

    /// Return a new weighted event.
    pub fn weighted(tof: f64, pulse_time_ns: i64, weight: f64, error_squared: f64) -> Self {
        Event {
            tof,
            pulse_time_ns,
            weight,
            error_squared,
        }
    }
}

/// Events of a single spectrum.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EventList {
    /// Spectrum number
    pub spectrum_number: i32,
    /// Events
    pub events: Vec<Event>,
}

impl EventList {
    /// Return a new EventList.
    pub fn new(spectrum_number: i32, events: Vec<Event>) -> Self {
        EventList {
            spectrum_number,
            events,
        }
    }

    /// Return an empty EventList.
    pub fn empty(spectrum_number: i32) -> Self {
        EventList::new(spectrum_number, vec![])
    }

    /// Number of (possibly weighted) events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the list has no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sum of event weights.
    pub fn total_weight(&self) -> f64 {
        self.events.iter().map(|event| event.weight).sum()
    }
}
