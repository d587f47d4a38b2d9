//! Signing-root computation: domain separation per duty kind and fork.
//!
//! Validator clients sign `hash_tree_root(SigningData{object_root, domain})`;
//! partial-signature verification and aggregate verification must derive the
//! identical root.

use serde::{Deserialize, Serialize};
use tree_hash::{Hash256, PackedEncoding, TreeHash, TreeHashType};
use tree_hash_derive::TreeHash;

use crate::duty::SLOTS_PER_EPOCH;
use crate::signed::SignedData;

pub const DOMAIN_BEACON_PROPOSER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
pub const DOMAIN_BEACON_ATTESTER: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
pub const DOMAIN_RANDAO: [u8; 4] = [0x02, 0x00, 0x00, 0x00];
pub const DOMAIN_DEPOSIT: [u8; 4] = [0x03, 0x00, 0x00, 0x00];
pub const DOMAIN_VOLUNTARY_EXIT: [u8; 4] = [0x04, 0x00, 0x00, 0x00];
pub const DOMAIN_SELECTION_PROOF: [u8; 4] = [0x05, 0x00, 0x00, 0x00];
pub const DOMAIN_AGGREGATE_AND_PROOF: [u8; 4] = [0x06, 0x00, 0x00, 0x00];
pub const DOMAIN_SYNC_COMMITTEE: [u8; 4] = [0x07, 0x00, 0x00, 0x00];
pub const DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF: [u8; 4] = [0x08, 0x00, 0x00, 0x00];
pub const DOMAIN_CONTRIBUTION_AND_PROOF: [u8; 4] = [0x09, 0x00, 0x00, 0x00];
pub const DOMAIN_APPLICATION_BUILDER: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// A 4-byte fork version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version(pub [u8; 4]);

impl TreeHash for Version {
    fn tree_hash_type() -> TreeHashType {
        TreeHashType::Vector
    }

    fn tree_hash_packed_encoding(&self) -> PackedEncoding {
        unreachable!("Vector should never be packed.")
    }

    fn tree_hash_packing_factor() -> usize {
        unreachable!("Vector should never be packed.")
    }

    fn tree_hash_root(&self) -> Hash256 {
        tree_hash::merkle_root(&self.0, 0)
    }
}

#[derive(TreeHash)]
struct ForkData {
    current_version: Version,
    genesis_validators_root: Hash256,
}

#[derive(TreeHash)]
struct SigningData {
    object_root: Hash256,
    domain: Hash256,
}

/// One scheduled fork: its version and activation epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub version: Version,
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
}

/// The chain context needed to compute signing domains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkInfo {
    #[serde(with = "crate::eth::serde_helpers::root_hex")]
    pub genesis_validators_root: Hash256,
    /// Forks sorted by activation epoch ascending; the first entry is genesis.
    pub forks: Vec<Fork>,
}

impl ForkInfo {
    /// A single-fork context, enough for tests and fixed-fork clusters.
    pub fn single(version: [u8; 4], genesis_validators_root: Hash256) -> Self {
        ForkInfo {
            genesis_validators_root,
            forks: vec![Fork {
                version: Version(version),
                epoch: 0,
            }],
        }
    }

    pub fn version_at_epoch(&self, epoch: u64) -> Version {
        self.forks
            .iter()
            .rev()
            .find(|fork| fork.epoch <= epoch)
            .map(|fork| fork.version)
            .unwrap_or_default()
    }

    /// `domain_type || fork_data_root[..28]` for the fork active at `epoch`.
    pub fn domain(&self, domain_type: [u8; 4], epoch: u64) -> Hash256 {
        let fork_data_root = ForkData {
            current_version: self.version_at_epoch(epoch),
            genesis_validators_root: self.genesis_validators_root,
        }
        .tree_hash_root();

        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&domain_type);
        domain[4..].copy_from_slice(&fork_data_root.as_slice()[..28]);
        Hash256::from_slice(&domain)
    }

    /// The builder domain uses the genesis fork version and a zero
    /// genesis-validators root.
    pub fn builder_domain(&self) -> Hash256 {
        let genesis_version = self
            .forks
            .first()
            .map(|fork| fork.version)
            .unwrap_or_default();
        let fork_data_root = ForkData {
            current_version: genesis_version,
            genesis_validators_root: Hash256::ZERO,
        }
        .tree_hash_root();

        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&DOMAIN_APPLICATION_BUILDER);
        domain[4..].copy_from_slice(&fork_data_root.as_slice()[..28]);
        Hash256::from_slice(&domain)
    }
}

pub fn signing_root(object_root: Hash256, domain: Hash256) -> Hash256 {
    SigningData {
        object_root,
        domain,
    }
    .tree_hash_root()
}

/// The root a validator (or share) signs for this payload.
pub fn signing_root_for(data: &SignedData, fork_info: &ForkInfo) -> Hash256 {
    // Builder registrations are signed under the application-builder domain,
    // which is not fork-scoped.
    if let SignedData::ValidatorRegistration(_) = data {
        return signing_root(data.message_root(), fork_info.builder_domain());
    }

    let (domain_type, epoch) = match data {
        SignedData::Attestation(att) => (DOMAIN_BEACON_ATTESTER, att.data().target.epoch),
        SignedData::Proposal(proposal) => {
            (DOMAIN_BEACON_PROPOSER, proposal.message.slot / SLOTS_PER_EPOCH)
        }
        SignedData::Randao(epoch) => (DOMAIN_RANDAO, epoch.epoch),
        SignedData::AggregateAndProof(aggregate) => (
            DOMAIN_AGGREGATE_AND_PROOF,
            aggregate.message.aggregate.data.target.epoch,
        ),
        SignedData::SyncMessage(message) => {
            (DOMAIN_SYNC_COMMITTEE, message.slot / SLOTS_PER_EPOCH)
        }
        SignedData::ContributionAndProof(contribution) => (
            DOMAIN_CONTRIBUTION_AND_PROOF,
            contribution.message.contribution.slot / SLOTS_PER_EPOCH,
        ),
        SignedData::VoluntaryExit(exit) => (DOMAIN_VOLUNTARY_EXIT, exit.message.epoch),
        SignedData::ValidatorRegistration(_) => unreachable!("handled above"),
        SignedData::BeaconCommitteeSelection(selection) => {
            (DOMAIN_SELECTION_PROOF, selection.slot / SLOTS_PER_EPOCH)
        }
        SignedData::SyncCommitteeSelection(selection) => (
            DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF,
            selection.slot / SLOTS_PER_EPOCH,
        ),
    };

    signing_root(data.message_root(), fork_info.domain(domain_type, epoch))
}
