//! Collective combination of per-worker results.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Barrier, Mutex};
use tracing::{event, Level};

use crate::error::{ErrorScope, ReductionError};
use crate::operations;
use crate::types::Dataset;

/// What a worker brings to a collective.
#[derive(Clone, Debug)]
pub enum Contribution {
    /// Accumulated groups, in group order
    Data(Vec<Dataset>),
    /// The worker had no chunks of the run
    Nothing,
    /// The worker failed to reduce its chunks
    Failed { reason: String, scope: ErrorScope },
}

impl Contribution {
    /// Contribution of a worker whose own chunks failed with `error`.
    pub fn failed(error: &ReductionError) -> Self {
        Contribution::Failed {
            reason: error.to_string(),
            scope: error.scope(),
        }
    }
}

/// Combines per-worker results into one result per group.
///
/// `gather` is collective: every worker must call it once per run, in the same order.
#[async_trait]
pub trait Gatherer: Send + Sync {
    /// Rank of this worker.
    fn rank(&self) -> usize;

    /// Number of cooperating workers.
    fn size(&self) -> usize;

    /// Returns true for the worker that writes output.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Combine the contributions of all workers.
    ///
    /// Every worker receives the same result. Returns None if no worker contributed data.
    ///
    /// # Arguments
    ///
    /// * `contribution`: This worker's contribution
    async fn gather(
        &self,
        contribution: Contribution,
    ) -> Result<Option<Vec<Dataset>>, ReductionError>;
}

/// Combine contributions in rank order.
///
/// If any worker failed, the most severe failure is returned, the lowest rank first among equals.
fn combine(
    contributions: Vec<(usize, Contribution)>,
) -> Result<Option<Vec<Dataset>>, ReductionError> {
    let failure = contributions
        .iter()
        .filter_map(|(rank, contribution)| match contribution {
            Contribution::Failed { reason, scope } => Some((*rank, reason, *scope)),
            _ => None,
        })
        .max_by_key(|(rank, _, scope)| (*scope, std::cmp::Reverse(*rank)));
    if let Some((rank, reason, scope)) = failure {
        return Err(ReductionError::PeerFailed {
            rank,
            reason: reason.clone(),
            scope,
        });
    }

    let mut combined: Option<Vec<Dataset>> = None;
    for (rank, contribution) in contributions {
        let Contribution::Data(groups) = contribution else {
            continue;
        };
        combined = match combined {
            None => Some(groups),
            Some(accumulated) => {
                if accumulated.len() != groups.len() {
                    return Err(ReductionError::Collective {
                        reason: format!(
                            "worker {} contributed {} groups, expected {}",
                            rank,
                            groups.len(),
                            accumulated.len()
                        ),
                    });
                }
                let merged = accumulated
                    .into_iter()
                    .zip(groups)
                    .map(|(left, right)| operations::add(left, right))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(merged)
            }
        };
    }
    Ok(combined)
}

/// A single worker. Gathering returns the worker's own result.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

#[async_trait]
impl Gatherer for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn gather(
        &self,
        contribution: Contribution,
    ) -> Result<Option<Vec<Dataset>>, ReductionError> {
        combine(vec![(0, contribution)])
    }
}

/// State shared by the workers of a [LocalCluster].
#[derive(Debug)]
struct Shared {
    slots: Mutex<Vec<Option<Contribution>>>,
    barrier: Barrier,
}

/// One worker of an in-process cluster.
///
/// Workers exchange contributions through a shared slot table guarded by a barrier.
#[derive(Clone, Debug)]
pub struct LocalCluster {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalCluster {
    /// Return the workers of a new cluster, ordered by rank.
    ///
    /// # Arguments
    ///
    /// * `size`: Number of workers
    pub fn new(size: usize) -> Vec<LocalCluster> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalCluster {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Gatherer for LocalCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    #[tracing::instrument(level = "DEBUG", skip(self, contribution))]
    async fn gather(
        &self,
        contribution: Contribution,
    ) -> Result<Option<Vec<Dataset>>, ReductionError> {
        self.shared.slots.lock().await[self.rank] = Some(contribution);
        self.shared.barrier.wait().await;

        let contributions = {
            let slots = self.shared.slots.lock().await;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| (rank, slot.clone().unwrap_or(Contribution::Nothing)))
                .collect::<Vec<_>>()
        };
        event!(
            Level::DEBUG,
            "Worker {} combining {} contributions",
            self.rank,
            contributions.len()
        );
        let result = combine(contributions);

        // Peers must have read every slot before any is reused.
        self.shared.barrier.wait().await;
        self.shared.slots.lock().await[self.rank] = None;
        result
    }
}
