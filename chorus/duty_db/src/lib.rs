//! Keyed storage of consensus-decided unsigned duty data with blocking reads.
//!
//! Validator-API handlers block on `await_*` until consensus has decided the
//! value for a slot and it has been stored here, so every validator client in
//! the cluster observes identical data. A second store of equal data is a
//! no-op; unequal data for the same key is an invariant violation that aborts
//! the component.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use tree_hash::TreeHash;

use dv_types::eth::{AttestationData, SyncCommitteeContribution, VersionedAttestation};
use dv_types::{Duty, DutyKind, Proposal, PubKey, Root, UnsignedData, UnsignedDataSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DutyDbError {
    /// The await was cancelled by shutdown.
    Cancelled,
    /// The duty passed its deadline and its state was pruned.
    Expired,
    /// A store carried different data for an already stored key.
    DataMismatch { duty: Duty, pubkey: PubKey },
    /// The stored payload kind does not match the duty kind.
    InvalidPayload { duty: Duty },
    /// No attester duty matches the requested reverse lookup.
    UnknownValidator { slot: u64, committee_index: u64, validator_index: u64 },
}

impl std::fmt::Display for DutyDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DutyDbError::Cancelled => write!(f, "duty database await cancelled"),
            DutyDbError::Expired => write!(f, "duty expired before data was stored"),
            DutyDbError::DataMismatch { duty, pubkey } => write!(
                f,
                "conflicting unsigned data stored for duty {duty} validator {pubkey}"
            ),
            DutyDbError::InvalidPayload { duty } => {
                write!(f, "unsigned data kind does not match duty {duty}")
            }
            DutyDbError::UnknownValidator {
                slot,
                committee_index,
                validator_index,
            } => write!(
                f,
                "no attester duty for slot {slot} committee {committee_index} validator {validator_index}"
            ),
        }
    }
}

impl std::error::Error for DutyDbError {}

type WaiterId = u64;

struct Waiters<K, V> {
    entries: Vec<(WaiterId, K, oneshot::Sender<V>)>,
}

impl<K: PartialEq + Copy, V: Clone> Waiters<K, V> {
    fn new() -> Self {
        Waiters { entries: Vec::new() }
    }

    fn add(&mut self, id: WaiterId, key: K, tx: oneshot::Sender<V>) {
        self.entries.push((id, key, tx));
    }

    fn remove(&mut self, id: WaiterId) {
        self.entries.retain(|(waiter_id, _, _)| *waiter_id != id);
    }

    /// Resolves and removes all waiters registered for `key`.
    fn notify(&mut self, key: K, value: &V) {
        let mut kept = Vec::with_capacity(self.entries.len());
        for (id, waiter_key, tx) in self.entries.drain(..) {
            if waiter_key == key {
                let _ = tx.send(value.clone());
            } else {
                kept.push((id, waiter_key, tx));
            }
        }
        self.entries = kept;
    }

    fn retain_keys<F: Fn(&K) -> bool>(&mut self, keep: F) {
        self.entries.retain(|(_, key, _)| keep(key));
    }
}

#[derive(Default)]
struct Inner {
    next_waiter_id: WaiterId,

    proposals: HashMap<u64, Proposal>,
    proposal_pubkeys: HashMap<u64, PubKey>,
    att_data: HashMap<(u64, u64), AttestationData>,
    // (slot, committee index, chain validator index) -> group pubkey
    att_pubkeys: HashMap<(u64, u64, u64), PubKey>,
    agg_atts: HashMap<(u64, Root), VersionedAttestation>,
    contributions: HashMap<(u64, u64, Root), SyncCommitteeContribution>,
}

/// Waiter lists live beside the value maps and are notified under the same
/// lock as the store, so a waiter arriving after the store always observes
/// the value.
struct WaiterSets {
    proposals: Waiters<u64, Proposal>,
    att_data: Waiters<(u64, u64), AttestationData>,
    agg_atts: Waiters<(u64, Root), VersionedAttestation>,
    contributions: Waiters<(u64, u64, Root), SyncCommitteeContribution>,
}

pub struct DutyDb {
    state: Mutex<(Inner, WaiterSets)>,
    shutdown: CancellationToken,
}

impl DutyDb {
    pub fn new(shutdown: CancellationToken) -> Self {
        DutyDb {
            state: Mutex::new((
                Inner::default(),
                WaiterSets {
                    proposals: Waiters::new(),
                    att_data: Waiters::new(),
                    agg_atts: Waiters::new(),
                    contributions: Waiters::new(),
                },
            )),
            shutdown,
        }
    }

    /// Stores a decided unsigned data set. Idempotent for equal data; a
    /// conflicting store for the same key is fatal.
    pub fn store(&self, duty: Duty, unsigned_set: UnsignedDataSet) -> Result<(), DutyDbError> {
        let mut state = self.state.lock();
        let (inner, waiters) = &mut *state;

        for (pubkey, unsigned) in unsigned_set {
            match (&duty.kind, unsigned) {
                (DutyKind::Proposer, UnsignedData::Proposal(proposal)) => {
                    if let Some(existing) = inner.proposals.get(&duty.slot) {
                        if *existing != proposal {
                            error!(%duty, %pubkey, "Conflicting proposal stored");
                            return Err(DutyDbError::DataMismatch { duty, pubkey });
                        }
                        continue;
                    }
                    inner.proposal_pubkeys.insert(duty.slot, pubkey);
                    waiters.proposals.notify(duty.slot, &proposal);
                    inner.proposals.insert(duty.slot, proposal);
                }
                (DutyKind::Attester, UnsignedData::Attestation(att)) => {
                    let key = (duty.slot, att.duty.committee_index);
                    if let Some(existing) = inner.att_data.get(&key) {
                        if *existing != att.data {
                            error!(%duty, %pubkey, "Conflicting attestation data stored");
                            return Err(DutyDbError::DataMismatch { duty, pubkey });
                        }
                    } else {
                        waiters.att_data.notify(key, &att.data);
                        inner.att_data.insert(key, att.data);
                    }
                    inner.att_pubkeys.insert(
                        (duty.slot, att.duty.committee_index, att.duty.validator_index),
                        pubkey,
                    );
                }
                (DutyKind::Aggregator, UnsignedData::AggregatedAttestation(agg)) => {
                    // Keyed by the attestation data root, computed on store.
                    let root = agg.data().tree_hash_root();
                    let key = (duty.slot, root);
                    if let Some(existing) = inner.agg_atts.get(&key) {
                        if *existing != agg {
                            error!(%duty, %pubkey, "Conflicting aggregate attestation stored");
                            return Err(DutyDbError::DataMismatch { duty, pubkey });
                        }
                        continue;
                    }
                    waiters.agg_atts.notify(key, &agg);
                    inner.agg_atts.insert(key, agg);
                }
                (DutyKind::SyncContribution, UnsignedData::SyncContribution(contribution)) => {
                    let key = (
                        duty.slot,
                        contribution.subcommittee_index,
                        contribution.beacon_block_root,
                    );
                    if let Some(existing) = inner.contributions.get(&key) {
                        if *existing != contribution {
                            error!(%duty, %pubkey, "Conflicting sync contribution stored");
                            return Err(DutyDbError::DataMismatch { duty, pubkey });
                        }
                        continue;
                    }
                    waiters.contributions.notify(key, &contribution);
                    inner.contributions.insert(key, contribution);
                }
                _ => return Err(DutyDbError::InvalidPayload { duty }),
            }
        }

        debug!(%duty, "Stored unsigned duty data");
        Ok(())
    }

    /// Blocks until a proposal for the slot is stored.
    pub async fn await_proposal(&self, slot: u64) -> Result<Proposal, DutyDbError> {
        let (id, rx) = {
            let mut state = self.state.lock();
            let (inner, waiters) = &mut *state;
            if let Some(proposal) = inner.proposals.get(&slot) {
                return Ok(proposal.clone());
            }
            let id = next_id(&mut inner.next_waiter_id);
            let (tx, rx) = oneshot::channel();
            waiters.proposals.add(id, slot, tx);
            (id, rx)
        };
        self.wait(rx, |state| state.1.proposals.remove(id)).await
    }

    /// Blocks until attestation data for the slot and committee is stored.
    pub async fn await_att_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, DutyDbError> {
        let key = (slot, committee_index);
        let (id, rx) = {
            let mut state = self.state.lock();
            let (inner, waiters) = &mut *state;
            if let Some(data) = inner.att_data.get(&key) {
                return Ok(*data);
            }
            let id = next_id(&mut inner.next_waiter_id);
            let (tx, rx) = oneshot::channel();
            waiters.att_data.add(id, key, tx);
            (id, rx)
        };
        self.wait(rx, |state| state.1.att_data.remove(id)).await
    }

    /// Blocks until the aggregate attestation for the data root is stored.
    pub async fn await_agg_attestation(
        &self,
        slot: u64,
        att_data_root: Root,
    ) -> Result<VersionedAttestation, DutyDbError> {
        let key = (slot, att_data_root);
        let (id, rx) = {
            let mut state = self.state.lock();
            let (inner, waiters) = &mut *state;
            if let Some(agg) = inner.agg_atts.get(&key) {
                return Ok(agg.clone());
            }
            let id = next_id(&mut inner.next_waiter_id);
            let (tx, rx) = oneshot::channel();
            waiters.agg_atts.add(id, key, tx);
            (id, rx)
        };
        self.wait(rx, |state| state.1.agg_atts.remove(id)).await
    }

    /// Blocks until the sync contribution for the subcommittee and block root
    /// is stored.
    pub async fn await_sync_contribution(
        &self,
        slot: u64,
        subcommittee_index: u64,
        beacon_block_root: Root,
    ) -> Result<SyncCommitteeContribution, DutyDbError> {
        let key = (slot, subcommittee_index, beacon_block_root);
        let (id, rx) = {
            let mut state = self.state.lock();
            let (inner, waiters) = &mut *state;
            if let Some(contribution) = inner.contributions.get(&key) {
                return Ok(contribution.clone());
            }
            let id = next_id(&mut inner.next_waiter_id);
            let (tx, rx) = oneshot::channel();
            waiters.contributions.add(id, key, tx);
            (id, rx)
        };
        self.wait(rx, |state| state.1.contributions.remove(id)).await
    }

    /// Deterministic reverse lookup of the group pubkey for a submitted
    /// attestation, available after the attester data was stored.
    pub fn pubkey_by_attestation(
        &self,
        slot: u64,
        committee_index: u64,
        validator_index: u64,
    ) -> Result<PubKey, DutyDbError> {
        self.state
            .lock()
            .0
            .att_pubkeys
            .get(&(slot, committee_index, validator_index))
            .copied()
            .ok_or(DutyDbError::UnknownValidator {
                slot,
                committee_index,
                validator_index,
            })
    }

    /// The pubkey whose proposal was stored for the slot, if any.
    pub fn proposer_pubkey(&self, slot: u64) -> Option<PubKey> {
        self.state.lock().0.proposal_pubkeys.get(&slot).copied()
    }

    /// Drops all state for slots before `before_slot`. Waiters for pruned
    /// slots resolve with [`DutyDbError::Expired`].
    pub fn prune(&self, before_slot: u64) {
        let mut state = self.state.lock();
        let (inner, waiters) = &mut *state;
        inner.proposals.retain(|slot, _| *slot >= before_slot);
        inner.proposal_pubkeys.retain(|slot, _| *slot >= before_slot);
        inner.att_data.retain(|(slot, _), _| *slot >= before_slot);
        inner.att_pubkeys.retain(|(slot, _, _), _| *slot >= before_slot);
        inner.agg_atts.retain(|(slot, _), _| *slot >= before_slot);
        inner
            .contributions
            .retain(|(slot, _, _), _| *slot >= before_slot);

        waiters.proposals.retain_keys(|slot| *slot >= before_slot);
        waiters.att_data.retain_keys(|(slot, _)| *slot >= before_slot);
        waiters.agg_atts.retain_keys(|(slot, _)| *slot >= before_slot);
        waiters
            .contributions
            .retain_keys(|(slot, _, _)| *slot >= before_slot);
    }

    /// Awaits the oneshot, mapping cancellation and pruning. `cleanup` removes
    /// this call's waiter when the await is cancelled.
    async fn wait<V>(
        &self,
        rx: oneshot::Receiver<V>,
        cleanup: impl FnOnce(&mut (Inner, WaiterSets)),
    ) -> Result<V, DutyDbError> {
        tokio::select! {
            result = rx => result.map_err(|_| DutyDbError::Expired),
            _ = self.shutdown.cancelled() => {
                cleanup(&mut self.state.lock());
                Err(DutyDbError::Cancelled)
            }
        }
    }
}

fn next_id(counter: &mut WaiterId) -> WaiterId {
    *counter += 1;
    *counter
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::eth::{AttesterDuty, BeaconBlock, BlockBody, Checkpoint, ForkVersion};
    use dv_types::{Signature, UnsignedAttestation};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tree_hash::Hash256;

    fn pubkey(byte: u8) -> PubKey {
        PubKey([byte; 48])
    }

    fn proposal(slot: u64) -> Proposal {
        Proposal {
            version: ForkVersion::Deneb,
            blinded: false,
            block: BeaconBlock {
                slot,
                proposer_index: 1,
                parent_root: Hash256::repeat_byte(1),
                state_root: Hash256::repeat_byte(2),
                body: BlockBody {
                    randao_reveal: Signature::default(),
                    graffiti: Hash256::ZERO,
                    fee_recipient: Default::default(),
                    execution_payload_root: Hash256::repeat_byte(3),
                },
            },
            execution_payload_value: 0,
            consensus_block_value: 0,
        }
    }

    fn att_set(slot: u64, committee_index: u64, validator_index: u64) -> UnsignedDataSet {
        let mut set = BTreeMap::new();
        set.insert(
            pubkey(validator_index as u8),
            UnsignedData::Attestation(UnsignedAttestation {
                data: AttestationData {
                    slot,
                    index: committee_index,
                    beacon_block_root: Hash256::repeat_byte(9),
                    source: Checkpoint {
                        epoch: 0,
                        root: Hash256::ZERO,
                    },
                    target: Checkpoint {
                        epoch: 1,
                        root: Hash256::repeat_byte(1),
                    },
                },
                duty: AttesterDuty {
                    pubkey: pubkey(validator_index as u8),
                    slot,
                    validator_index,
                    committee_index,
                    committee_length: 128,
                    committees_at_slot: 2,
                    validator_committee_index: 5,
                },
            }),
        );
        set
    }

    fn db() -> DutyDb {
        DutyDb::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn await_after_store_returns_immediately() {
        let db = db();
        let mut set = BTreeMap::new();
        set.insert(pubkey(1), UnsignedData::Proposal(proposal(64)));
        db.store(Duty::proposer(64), set).unwrap();

        let stored = db.await_proposal(64).await.unwrap();
        assert_eq!(stored, proposal(64));
        // Repeated awaits after store return the same value.
        assert_eq!(db.await_proposal(64).await.unwrap(), proposal(64));
    }

    #[tokio::test]
    async fn await_blocks_until_store() {
        let db = Arc::new(db());
        let reader = db.clone();
        let handle =
            tokio::spawn(async move { reader.await_att_data(32, 0).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        db.store(Duty::attester(32), att_set(32, 0, 7)).unwrap();

        let data = handle.await.unwrap().unwrap();
        assert_eq!(data.slot, 32);
    }

    #[tokio::test]
    async fn equal_store_is_noop_unequal_is_fatal() {
        let db = db();
        db.store(Duty::attester(32), att_set(32, 0, 7)).unwrap();
        db.store(Duty::attester(32), att_set(32, 0, 7)).unwrap();

        let mut conflicting = att_set(32, 0, 7);
        if let Some(UnsignedData::Attestation(att)) = conflicting.get_mut(&pubkey(7)) {
            att.data.beacon_block_root = Hash256::repeat_byte(0xee);
        }
        let err = db.store(Duty::attester(32), conflicting).unwrap_err();
        assert!(matches!(err, DutyDbError::DataMismatch { .. }));
    }

    #[tokio::test]
    async fn cancellation_resolves_await() {
        let shutdown = CancellationToken::new();
        let db = Arc::new(DutyDb::new(shutdown.clone()));
        let reader = db.clone();
        let handle = tokio::spawn(async move { reader.await_proposal(10).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), Err(DutyDbError::Cancelled));
    }

    #[tokio::test]
    async fn prune_expires_waiters_and_state() {
        let db = Arc::new(db());
        let reader = db.clone();
        let handle = tokio::spawn(async move { reader.await_proposal(5).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        db.prune(6);
        assert_eq!(handle.await.unwrap(), Err(DutyDbError::Expired));

        db.store(Duty::attester(3), att_set(3, 0, 7)).unwrap();
        db.prune(4);
        assert!(db.pubkey_by_attestation(3, 0, 7).is_err());
    }

    #[tokio::test]
    async fn pubkey_reverse_lookup() {
        let db = db();
        db.store(Duty::attester(32), att_set(32, 1, 9)).unwrap();
        assert_eq!(db.pubkey_by_attestation(32, 1, 9).unwrap(), pubkey(9));
        assert!(db.pubkey_by_attestation(32, 0, 9).is_err());
    }
}
