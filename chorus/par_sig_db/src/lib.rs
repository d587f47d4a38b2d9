//! Partial-signature store.
//!
//! Holds, per `(duty, pubkey)`, the partial signatures received from the
//! local validator client and from peers, keyed by share index. A second,
//! distinct partial from the same share is a double-sign and is rejected.
//! When the number of distinct partials reaches the cluster threshold the set
//! is handed to the aggregation subscribers exactly once.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use dv_types::{Duty, ParSignedData, ParSignedDataSet, PubKey};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Receives locally stored sets for broadcast to peers.
pub type InternalSubscriber =
    Box<dyn Fn(Duty, ParSignedDataSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Receives the full partial set for one `(duty, pubkey)` when the threshold
/// is reached.
pub type ThresholdSubscriber = Box<
    dyn Fn(Duty, PubKey, Vec<ParSignedData>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParSigDbError {
    /// A share submitted two distinct payloads for the same duty.
    DoubleSign { duty: Duty, pubkey: PubKey, share_idx: u64 },
    SubscriberFailed(String),
}

impl std::fmt::Display for ParSigDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParSigDbError::DoubleSign {
                duty,
                pubkey,
                share_idx,
            } => write!(
                f,
                "double sign detected for duty {duty} validator {pubkey} share {share_idx}"
            ),
            ParSigDbError::SubscriberFailed(err) => {
                write!(f, "partial-signature subscriber failed: {err}")
            }
        }
    }
}

impl std::error::Error for ParSigDbError {}

#[derive(Default)]
struct EntryState {
    partials: BTreeMap<u64, ParSignedData>,
    threshold_fired: bool,
}

enum Insert {
    Added,
    Duplicate,
}

pub struct ParSigDb {
    threshold: usize,
    entries: Mutex<HashMap<(Duty, PubKey), EntryState>>,
    internal_subs: Vec<InternalSubscriber>,
    threshold_subs: Vec<ThresholdSubscriber>,
}

impl ParSigDb {
    pub fn new(threshold: usize) -> Self {
        ParSigDb {
            threshold,
            entries: Mutex::new(HashMap::new()),
            internal_subs: Vec::new(),
            threshold_subs: Vec::new(),
        }
    }

    /// Registers a broadcast callback invoked once per locally stored set.
    /// Must be called before duty flow starts.
    pub fn subscribe_internal(&mut self, subscriber: InternalSubscriber) {
        self.internal_subs.push(subscriber);
    }

    /// Registers a threshold callback invoked exactly once per
    /// `(duty, pubkey)` reaching the cluster threshold. Must be called before
    /// duty flow starts.
    pub fn subscribe_threshold(&mut self, subscriber: ThresholdSubscriber) {
        self.threshold_subs.push(subscriber);
    }

    /// Stores partial signatures produced by the local validator client and
    /// hands the set to the broadcast subscribers.
    pub async fn store_internal(
        &self,
        duty: Duty,
        set: ParSignedDataSet,
    ) -> Result<(), ParSigDbError> {
        for (pubkey, parsig) in &set {
            self.insert(duty, *pubkey, parsig.clone())?;
        }

        debug!(%duty, validators = set.len(), "Stored internal partial signatures");

        for subscriber in &self.internal_subs {
            // Clone before each subscriber.
            subscriber(duty, set.clone())
                .await
                .map_err(|err| ParSigDbError::SubscriberFailed(err.to_string()))?;
        }

        self.flush_thresholds(duty, &set).await
    }

    /// Stores partial signatures received from a peer. Duplicate delivery is
    /// deduplicated; a conflicting partial from the same share is logged and
    /// dropped without failing the rest of the set.
    pub async fn store_external(
        &self,
        duty: Duty,
        set: ParSignedDataSet,
    ) -> Result<(), ParSigDbError> {
        for (pubkey, parsig) in &set {
            if let Err(err) = self.insert(duty, *pubkey, parsig.clone()) {
                error!(%duty, %pubkey, %err, "Dropping conflicting peer partial signature");
            }
        }

        self.flush_thresholds(duty, &set).await
    }

    fn insert(
        &self,
        duty: Duty,
        pubkey: PubKey,
        parsig: ParSignedData,
    ) -> Result<Insert, ParSigDbError> {
        let mut entries = self.entries.lock();
        let state = entries.entry((duty, pubkey)).or_default();

        match state.partials.get(&parsig.share_idx) {
            None => {
                state.partials.insert(parsig.share_idx, parsig);
                Ok(Insert::Added)
            }
            Some(existing) if *existing == parsig => Ok(Insert::Duplicate),
            Some(_) => {
                // Persistent diagnostic: this share produced two different
                // payloads for the same duty.
                error!(
                    %duty,
                    %pubkey,
                    share_idx = parsig.share_idx,
                    "Double sign detected, rejecting conflicting partial signature"
                );
                Err(ParSigDbError::DoubleSign {
                    duty,
                    pubkey,
                    share_idx: parsig.share_idx,
                })
            }
        }
    }

    /// Fires threshold subscribers for every pubkey in `set` whose entry just
    /// reached the threshold.
    async fn flush_thresholds(
        &self,
        duty: Duty,
        set: &ParSignedDataSet,
    ) -> Result<(), ParSigDbError> {
        let mut ready = Vec::new();
        {
            let mut entries = self.entries.lock();
            for pubkey in set.keys() {
                let Some(state) = entries.get_mut(&(duty, *pubkey)) else {
                    continue;
                };
                if state.threshold_fired || state.partials.len() < self.threshold {
                    continue;
                }
                state.threshold_fired = true;
                ready.push((*pubkey, state.partials.values().cloned().collect::<Vec<_>>()));
            }
        }

        for (pubkey, partials) in ready {
            debug!(%duty, %pubkey, count = partials.len(), "Partial signature threshold reached");
            for subscriber in &self.threshold_subs {
                subscriber(duty, pubkey, partials.clone())
                    .await
                    .map_err(|err| ParSigDbError::SubscriberFailed(err.to_string()))?;
            }
        }

        Ok(())
    }

    /// Drops all state for duties with slots before `before_slot`.
    pub fn prune(&self, before_slot: u64) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(duty, _), _| duty.slot >= before_slot);
        let dropped = before - entries.len();
        if dropped > 0 {
            warn!(dropped, before_slot, "Pruned expired partial signature state");
        }
    }

    /// Number of partials currently stored for `(duty, pubkey)`.
    pub fn partial_count(&self, duty: Duty, pubkey: PubKey) -> usize {
        self.entries
            .lock()
            .get(&(duty, pubkey))
            .map(|state| state.partials.len())
            .unwrap_or(0)
    }
}
