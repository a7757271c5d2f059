//! Run-scoped state of a reduction job.
//!
//! A [RunContext] is owned by one worker and passed through the pipeline. It replaces
//! process-wide caches: every job (and every worker of a job) has its own.

use hashbrown::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{event, Level};

use crate::characterization::{CharacterizationInfo, CharacterizationMatcher};
use crate::types::{Dataset, RunInfo};

/// Characterization cache and reduced-dataset session of one worker.
#[derive(Debug, Default)]
pub struct RunContext {
    characterizations: HashMap<i64, Arc<CharacterizationInfo>>,
    session: HashMap<String, Dataset>,
    saved: Vec<PathBuf>,
}

impl RunContext {
    /// Return a new, empty RunContext.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached characterization of a run, if it has been resolved.
    pub fn cached_characterization(&self, run_number: i64) -> Option<Arc<CharacterizationInfo>> {
        self.characterizations.get(&run_number).cloned()
    }

    /// Resolve the characterization of a run, at most once per run number.
    ///
    /// # Arguments
    ///
    /// * `matcher`: Characterization matcher
    /// * `run`: Metadata of the run
    pub fn characterize(
        &mut self,
        matcher: &CharacterizationMatcher,
        run: &RunInfo,
    ) -> Arc<CharacterizationInfo> {
        self.characterizations
            .entry(run.run_number)
            .or_insert_with(|| {
                let info = matcher.determine(run);
                event!(
                    Level::INFO,
                    "Run {}: container {:?}, vanadium {:?}, vanadium background {:?}",
                    run.run_number,
                    info.container,
                    info.vanadium,
                    info.vanadium_background
                );
                Arc::new(info)
            })
            .clone()
    }

    /// Returns a previously reduced dataset.
    pub fn reduced(&self, name: &str) -> Option<&Dataset> {
        self.session.get(name)
    }

    /// Store a reduced dataset for reuse by later runs.
    pub fn store(&mut self, dataset: Dataset) {
        event!(Level::DEBUG, "Keeping {} for later runs", dataset.name);
        self.session.insert(dataset.name.clone(), dataset);
    }

    /// Number of datasets in the session.
    pub fn session_len(&self) -> usize {
        self.session.len()
    }

    /// Record files written.
    pub fn record_saved(&mut self, paths: Vec<PathBuf>) {
        self.saved.extend(paths);
    }

    /// Files written so far.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characterization::RunOverrides;
    use crate::test_utils;

    fn matcher(vanadium: i64) -> CharacterizationMatcher {
        let overrides = RunOverrides {
            vanadium: vec![vanadium],
            ..Default::default()
        };
        CharacterizationMatcher::new(None, overrides, vec![], vec![])
    }

    #[test]
    fn test_characterize_is_cached() {
        let mut context = RunContext::new();
        let run = RunInfo::new(1000, 0);
        assert_eq!(None, context.cached_characterization(1000));
        let first = context.characterize(&matcher(2000), &run);
        assert_eq!(vec![2000], first.vanadium);
        // A different matcher is not consulted again for the same run.
        let second = context.characterize(&matcher(3000), &run);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(Some(first), context.cached_characterization(1000));
    }

    #[test]
    fn test_characterize_is_idempotent() {
        let run = RunInfo::new(1000, 0);
        let first = RunContext::new().characterize(&matcher(2000), &run);
        let second = RunContext::new().characterize(&matcher(2000), &run);
        assert_eq!(first, second);
    }

    #[test]
    fn test_session() {
        let mut context = RunContext::new();
        assert!(context.reduced("PG3_2000").is_none());
        let dataset = test_utils::histogram_run(2000, &[1.0]).renamed("PG3_2000");
        context.store(dataset.clone());
        assert_eq!(Some(&dataset), context.reduced("PG3_2000"));
        assert_eq!(1, context.session_len());
    }

    #[test]
    fn test_saved() {
        let mut context = RunContext::new();
        context.record_saved(vec![PathBuf::from("/tmp/PG3_1000.gsa")]);
        context.record_saved(vec![PathBuf::from("/tmp/PG3_1000.getn")]);
        assert_eq!(2, context.saved().len());
    }
}
