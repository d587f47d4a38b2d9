//! Consensus seam of the duty pipeline.
//!
//! The byzantine-agreement wire protocol between operators is an external
//! collaborator; the pipeline only consumes two operations: `propose` is
//! called exactly once per duty by the proposer-of-record (round-robin by
//! slot), and the decided subscription fires exactly once per duty before its
//! deadline. [`LoopbackConsensus`] implements the contract for single-node
//! clusters and tests by deciding the first proposal immediately.

use std::collections::HashSet;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use dv_types::{Duty, UnsignedDataSet};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked exactly once per duty with the decided value.
pub type DecidedSubscriber =
    Box<dyn Fn(Duty, UnsignedDataSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// The consensus operations the pipeline consumes.
pub trait Consensus: Send + Sync {
    /// Proposes a value for the duty. Called by the proposer-of-record only.
    fn propose(&self, duty: Duty, data: UnsignedDataSet)
        -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Whether this operator is the proposer-of-record for the slot, round-robin
/// across the cluster.
pub fn is_proposer_of_record(cluster_size: u64, operator_index: u64, slot: u64) -> bool {
    slot % cluster_size == operator_index
}

/// Decides the first proposed value per duty. Satisfies the consensus
/// contract when there is a single proposer-of-record; a real BFT engine
/// plugs in behind the same [`Consensus`] trait for multi-operator clusters.
pub struct LoopbackConsensus {
    decided: Mutex<HashSet<Duty>>,
    subscribers: Vec<DecidedSubscriber>,
}

impl LoopbackConsensus {
    pub fn new() -> Self {
        LoopbackConsensus {
            decided: Mutex::new(HashSet::new()),
            subscribers: Vec::new(),
        }
    }

    /// Registers a decided-value subscriber. Must be called before the first
    /// proposal.
    pub fn subscribe(&mut self, subscriber: DecidedSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Drops decide-once state for duties before `before_slot`.
    pub fn prune(&self, before_slot: u64) {
        self.decided.lock().retain(|duty| duty.slot >= before_slot);
    }
}

impl Default for LoopbackConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl Consensus for LoopbackConsensus {
    fn propose(
        &self,
        duty: Duty,
        data: UnsignedDataSet,
    ) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            {
                let mut decided = self.decided.lock();
                if !decided.insert(duty) {
                    // Duplicate proposal for an already decided duty.
                    warn!(%duty, "Ignoring proposal for decided duty");
                    return Ok(());
                }
            }

            debug!(%duty, "Consensus decided");
            for subscriber in &self.subscribers {
                subscriber(duty, data.clone()).await?;
            }
            Ok(())
        })
    }
}
