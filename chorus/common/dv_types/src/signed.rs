use serde::{Deserialize, Serialize};
use tree_hash::{Hash256, TreeHash};

use crate::eth::{
    BeaconBlock, BeaconCommitteeSelection, ForkVersion, SignedAggregateAndProof,
    SignedContributionAndProof, SignedEpoch, SignedValidatorRegistration, SignedVoluntaryExit,
    SyncCommitteeMessage, SyncCommitteeSelection, VersionedAttestation,
};
use crate::keys::Signature;

/// A signed block proposal. `blinded` and `version` are explicit so that
/// submissions can be matched exactly against the agreed proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub version: ForkVersion,
    pub blinded: bool,
    pub message: BeaconBlock,
    pub signature: Signature,
}

/// A payload plus a BLS signature over it. The same representation carries
/// partial signatures (inside [`ParSignedData`]) and group signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignedData {
    Attestation(VersionedAttestation),
    Proposal(SignedProposal),
    Randao(SignedEpoch),
    AggregateAndProof(SignedAggregateAndProof),
    SyncMessage(SyncCommitteeMessage),
    ContributionAndProof(SignedContributionAndProof),
    VoluntaryExit(SignedVoluntaryExit),
    ValidatorRegistration(SignedValidatorRegistration),
    BeaconCommitteeSelection(BeaconCommitteeSelection),
    SyncCommitteeSelection(SyncCommitteeSelection),
}

impl SignedData {
    /// The signature carried by this payload.
    pub fn signature(&self) -> Signature {
        match self {
            SignedData::Attestation(att) => att.attestation.signature,
            SignedData::Proposal(proposal) => proposal.signature,
            SignedData::Randao(epoch) => epoch.signature,
            SignedData::AggregateAndProof(aggregate) => aggregate.signature,
            SignedData::SyncMessage(message) => message.signature,
            SignedData::ContributionAndProof(contribution) => contribution.signature,
            SignedData::VoluntaryExit(exit) => exit.signature,
            SignedData::ValidatorRegistration(registration) => registration.signature,
            SignedData::BeaconCommitteeSelection(selection) => selection.selection_proof,
            SignedData::SyncCommitteeSelection(selection) => selection.selection_proof,
        }
    }

    /// Returns a copy with the signature replaced, used when swapping a
    /// partial signature for the recovered group signature.
    pub fn with_signature(&self, signature: Signature) -> SignedData {
        let mut data = self.clone();
        match &mut data {
            SignedData::Attestation(att) => att.attestation.signature = signature,
            SignedData::Proposal(proposal) => proposal.signature = signature,
            SignedData::Randao(epoch) => epoch.signature = signature,
            SignedData::AggregateAndProof(aggregate) => aggregate.signature = signature,
            SignedData::SyncMessage(message) => message.signature = signature,
            SignedData::ContributionAndProof(contribution) => {
                contribution.signature = signature
            }
            SignedData::VoluntaryExit(exit) => exit.signature = signature,
            SignedData::ValidatorRegistration(registration) => {
                registration.signature = signature
            }
            SignedData::BeaconCommitteeSelection(selection) => {
                selection.selection_proof = signature
            }
            SignedData::SyncCommitteeSelection(selection) => {
                selection.selection_proof = signature
            }
        }
        data
    }

    /// Root of the signed message. Two payloads for the same duty must agree
    /// on this root before their signatures may be combined.
    pub fn message_root(&self) -> Hash256 {
        match self {
            SignedData::Attestation(att) => att.data().tree_hash_root(),
            SignedData::Proposal(proposal) => proposal.message.tree_hash_root(),
            SignedData::Randao(epoch) => epoch.epoch.tree_hash_root(),
            SignedData::AggregateAndProof(aggregate) => aggregate.message.tree_hash_root(),
            SignedData::SyncMessage(message) => message.beacon_block_root.tree_hash_root(),
            SignedData::ContributionAndProof(contribution) => {
                contribution.message.tree_hash_root()
            }
            SignedData::VoluntaryExit(exit) => exit.message.tree_hash_root(),
            SignedData::ValidatorRegistration(registration) => {
                registration.message.tree_hash_root()
            }
            SignedData::BeaconCommitteeSelection(selection) => selection.slot.tree_hash_root(),
            SignedData::SyncCommitteeSelection(selection) => {
                crate::eth::SyncAggregatorSelectionData {
                    slot: selection.slot,
                    subcommittee_index: selection.subcommittee_index,
                }
                .tree_hash_root()
            }
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            SignedData::Attestation(_) => "attestation",
            SignedData::Proposal(_) => "proposal",
            SignedData::Randao(_) => "randao",
            SignedData::AggregateAndProof(_) => "aggregate_and_proof",
            SignedData::SyncMessage(_) => "sync_message",
            SignedData::ContributionAndProof(_) => "contribution_and_proof",
            SignedData::VoluntaryExit(_) => "voluntary_exit",
            SignedData::ValidatorRegistration(_) => "validator_registration",
            SignedData::BeaconCommitteeSelection(_) => "beacon_committee_selection",
            SignedData::SyncCommitteeSelection(_) => "sync_committee_selection",
        }
    }
}

/// A partial signature produced by one operator's key share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParSignedData {
    pub data: SignedData,
    /// 1-indexed share index of the signing operator.
    pub share_idx: u64,
}

impl ParSignedData {
    pub fn new(data: SignedData, share_idx: u64) -> Self {
        ParSignedData { data, share_idx }
    }

    pub fn signature(&self) -> Signature {
        self.data.signature()
    }
}
