//! Prometheus metrics of the reduction job.

use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

use crate::error::ReductionError;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Chunk counter
    pub static ref CHUNKS_PROCESSED: IntCounter = IntCounter::new(
        "chunks_processed", "The number of chunks loaded and focused"
    ).unwrap();
    // Raw event counter
    pub static ref EVENTS_LOADED: IntCounter = IntCounter::new(
        "events_loaded", "The number of raw events loaded"
    ).unwrap();
    // Sample run counter
    pub static ref RUNS_REDUCED: IntCounter = IntCounter::new(
        "runs_reduced", "The number of sample runs reduced"
    ).unwrap();
    // Failed run counter by stage
    pub static ref RUN_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("run_failures", "The number of runs that failed to reduce"),
        &["stage"]
    ).unwrap();
    // Stage histogram by duration
    pub static ref STAGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("stage_duration_seconds", "The time taken by each reduction stage"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &["stage"],
    ).unwrap();
}

/// Register all metrics with the registry.
///
/// Registering twice is harmless.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CHUNKS_PROCESSED.clone()),
        Box::new(EVENTS_LOADED.clone()),
        Box::new(RUNS_REDUCED.clone()),
        Box::new(RUN_FAILURES.clone()),
        Box::new(STAGE_DURATION.clone()),
    ];
    for collector in collectors {
        // AlreadyReg is expected when called more than once.
        let _ = REGISTRY.register(collector);
    }
}

/// Render all metrics in the Prometheus text format.
pub fn gather_metrics() -> Result<String, ReductionError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Record the duration of a reduction stage.
pub fn observe_stage(stage: &str, duration: std::time::Duration) {
    STAGE_DURATION
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}
