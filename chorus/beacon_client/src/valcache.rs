//! Per-epoch cache of the cluster's validator identities.
//!
//! Reads hit the shared lock; refills take the exclusive lock and are
//! idempotent under it. `trim` is called only by the scheduler on epoch
//! boundaries, never from within a read.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::{BeaconApi, BeaconError};
use dv_types::eth::Validator;
use dv_types::PubKey;

/// Active validator indices mapped to their group pubkeys.
pub type ActiveValidators = BTreeMap<u64, PubKey>;

/// The complete validators response, including inactive entries.
pub type CompleteValidators = BTreeMap<u64, Validator>;

pub struct ValidatorCache {
    client: Arc<dyn BeaconApi>,
    pubkeys: Vec<PubKey>,
    cache: RwLock<CacheState>,
}

#[derive(Default)]
struct CacheState {
    active: Option<ActiveValidators>,
    complete: Option<CompleteValidators>,
}

impl ValidatorCache {
    pub fn new(client: Arc<dyn BeaconApi>, pubkeys: Vec<PubKey>) -> Self {
        ValidatorCache {
            client,
            pubkeys,
            cache: RwLock::new(CacheState::default()),
        }
    }

    /// Invalidates the cache. Called on epoch boundaries.
    pub fn trim(&self) {
        let mut cache = self.cache.write();
        cache.active = None;
        cache.complete = None;
    }

    /// Returns the cached validators or fetches them at the head state,
    /// populating the cache.
    pub async fn get_by_head(
        &self,
    ) -> Result<(ActiveValidators, CompleteValidators), BeaconError> {
        {
            let cache = self.cache.read();
            if let (Some(active), Some(complete)) = (&cache.active, &cache.complete) {
                return Ok((active.clone(), complete.clone()));
            }
        }

        let validators = self.client.validators("head", &self.pubkeys).await?;
        let (active, complete) = index_validators(validators);

        // Refill under the exclusive lock; a concurrent refill stored the
        // same epoch's data, so overwriting is idempotent.
        let mut cache = self.cache.write();
        cache.active = Some(active.clone());
        cache.complete = Some(complete.clone());

        Ok((active, complete))
    }

    /// Fetches validators at the given slot, populating the cache. On
    /// failure it falls back to the head state and reports
    /// `refreshed_by_slot = false` so the caller retries next slot.
    pub async fn get_by_slot(
        &self,
        slot: u64,
    ) -> Result<(ActiveValidators, CompleteValidators, bool), BeaconError> {
        let mut refreshed_by_slot = true;

        let validators = match self.client.validators(&slot.to_string(), &self.pubkeys).await {
            Ok(validators) => validators,
            Err(err) => {
                refreshed_by_slot = false;
                warn!(slot, %err, "Validator fetch by slot failed, falling back to head");
                self.client.validators("head", &self.pubkeys).await?
            }
        };

        let (active, complete) = index_validators(validators);

        let mut cache = self.cache.write();
        cache.active = Some(active.clone());
        cache.complete = Some(complete.clone());

        Ok((active, complete, refreshed_by_slot))
    }
}

fn index_validators(validators: Vec<Validator>) -> (ActiveValidators, CompleteValidators) {
    let mut active = ActiveValidators::new();
    let mut complete = CompleteValidators::new();
    for validator in validators {
        if validator.status.is_active() {
            active.insert(validator.index, validator.validator.pubkey);
        }
        complete.insert(validator.index, validator);
    }
    (active, complete)
}
