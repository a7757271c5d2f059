pub mod dataset;
pub mod event;
pub mod run_info;

// Re-export types for convenience.
pub use crate::types::dataset::{edges_match, Dataset, DatasetData, EventData, Histogram, Units};
pub use crate::types::event::{Event, EventList};
pub use crate::types::run_info::{PropertyValue, RunInfo};
