use serde::{Deserialize, Serialize};
use tree_hash::{Hash256, TreeHash};

use crate::eth::{
    serde_helpers::quoted_u128, AttestationData, AttesterDuty, BeaconBlock, ForkVersion,
    SyncCommitteeContribution, VersionedAttestation,
};

/// Attestation data paired with the attester duty it was fetched for, so that
/// submissions can be matched back to a validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedAttestation {
    pub data: AttestationData,
    pub duty: AttesterDuty,
}

/// A block proposal as returned by v3 block production. The fork and the
/// blinded flag are explicit fields; the block structure is shared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub version: ForkVersion,
    pub blinded: bool,
    pub block: BeaconBlock,
    #[serde(with = "quoted_u128")]
    pub execution_payload_value: u128,
    #[serde(with = "quoted_u128")]
    pub consensus_block_value: u128,
}

impl Proposal {
    /// Root of the block message, the value the proposer signs.
    pub fn message_root(&self) -> Hash256 {
        self.block.tree_hash_root()
    }
}

/// The canonical unsigned payload of one duty for one validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsignedData {
    Attestation(UnsignedAttestation),
    AggregatedAttestation(VersionedAttestation),
    Proposal(Proposal),
    SyncContribution(SyncCommitteeContribution),
}

impl UnsignedData {
    pub fn slot(&self) -> u64 {
        match self {
            UnsignedData::Attestation(att) => att.data.slot,
            UnsignedData::AggregatedAttestation(att) => att.data().slot,
            UnsignedData::Proposal(proposal) => proposal.block.slot,
            UnsignedData::SyncContribution(contribution) => contribution.slot,
        }
    }

    /// Root of the payload a validator client will sign over.
    pub fn payload_root(&self) -> Hash256 {
        match self {
            UnsignedData::Attestation(att) => att.data.tree_hash_root(),
            UnsignedData::AggregatedAttestation(att) => att.attestation.tree_hash_root(),
            UnsignedData::Proposal(proposal) => proposal.message_root(),
            UnsignedData::SyncContribution(contribution) => contribution.tree_hash_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::{BlockBody, Checkpoint};
    use crate::keys::{PubKey, Signature};

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
            execution_payload_value: 1_000_000_000_000_000_000,
            consensus_block_value: 42_000_000_000,
        }
    }

    #[test]
    fn proposal_values_serialize_quoted() {
        let json = serde_json::to_value(proposal(64)).unwrap();
        assert_eq!(json["execution_payload_value"], "1000000000000000000");
        assert_eq!(json["consensus_block_value"], "42000000000");
        assert_eq!(json["version"], "deneb");
    }

    #[test]
    fn unsigned_data_slot_and_root() {
        let data = UnsignedData::Proposal(proposal(64));
        assert_eq!(data.slot(), 64);
        assert_eq!(data.payload_root(), proposal(64).message_root());
    }

    #[test]
    fn attestation_payload_root_matches_data_root() {
        let att = UnsignedAttestation {
            data: AttestationData {
                slot: 32,
                index: 0,
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
                pubkey: PubKey([0; 48]),
                slot: 32,
                validator_index: 7,
                committee_index: 0,
                committee_length: 128,
                committees_at_slot: 4,
                validator_committee_index: 3,
            },
        };
        let root = att.data.tree_hash_root();
        assert_eq!(UnsignedData::Attestation(att).payload_root(), root);
    }
}
