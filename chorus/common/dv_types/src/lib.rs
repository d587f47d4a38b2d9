//! Core data model of the duty pipeline: duties, duty definitions, unsigned
//! and signed payloads, and the partial-signature types exchanged between
//! operators.
//!
//! Set types are `BTreeMap`s keyed by the validator's group public key. All
//! contained data is owned, so `Clone` on a set is a deep copy; stages clone a
//! set before handing it to each subscriber so that no subscriber can observe
//! another's mutations.

use std::collections::BTreeMap;

pub mod duty;
pub mod eth;
pub mod keys;
pub mod signed;
pub mod signing;
pub mod unsigned;

pub use duty::{Duty, DutyKind, SLOTS_PER_EPOCH};
pub use keys::{PubKey, Signature};
pub use signed::{ParSignedData, SignedData};
pub use unsigned::{Proposal, UnsignedAttestation, UnsignedData};

pub use tree_hash::Hash256 as Root;

/// Per-validator duty definitions resolved by the scheduler.
pub type DutyDefinitionSet = BTreeMap<PubKey, DutyDefinition>;

/// Per-validator unsigned payloads fetched for one duty.
pub type UnsignedDataSet = BTreeMap<PubKey, UnsignedData>;

/// Per-validator fully signed payloads.
pub type SignedDataSet = BTreeMap<PubKey, SignedData>;

/// Per-validator partial signatures for one duty.
pub type ParSignedDataSet = BTreeMap<PubKey, ParSignedData>;

/// What one validator must do in one duty. Only the duty kinds that the
/// scheduler resolves from the beacon node carry definitions; the remaining
/// kinds are implied by validator-client submissions.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DutyDefinition {
    Attester(eth::AttesterDuty),
    Proposer(eth::ProposerDuty),
    SyncCommittee(eth::SyncCommitteeDuty),
}

impl DutyDefinition {
    pub fn validator_index(&self) -> u64 {
        match self {
            DutyDefinition::Attester(duty) => duty.validator_index,
            DutyDefinition::Proposer(duty) => duty.validator_index,
            DutyDefinition::SyncCommittee(duty) => duty.validator_index,
        }
    }
}
