//! Beacon-chain payload types touched by the duty pipeline.
//!
//! These model the REST representations the pipeline reads and writes. Fork
//! differences are carried as an explicit [`ForkVersion`] field on the
//! versioned containers rather than inferred from structure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tree_hash::{Hash256, PackedEncoding, TreeHash, TreeHashType};
use tree_hash_derive::TreeHash;

use crate::keys::{PubKey, Signature};

/// Serde helpers for types the upstream helpers do not cover.
pub mod serde_helpers {
    use serde::{Deserialize, Deserializer, Serializer};
    use tree_hash::Hash256;

    /// 0x-hex round-tripping for 32-byte roots.
    pub mod root_hex {
        use super::*;

        pub fn serialize<S: Serializer>(root: &Hash256, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format!("0x{}", hex::encode(root.as_slice())))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash256, D::Error> {
            let s = String::deserialize(deserializer)?;
            let stripped = s
                .strip_prefix("0x")
                .ok_or_else(|| serde::de::Error::custom("root must be 0x-prefixed"))?;
            let bytes = hex::decode(stripped).map_err(serde::de::Error::custom)?;
            if bytes.len() != 32 {
                return Err(serde::de::Error::custom("root must be 32 bytes"));
            }
            Ok(Hash256::from_slice(&bytes))
        }
    }

    /// Beacon-API quoted integers that may be absent.
    pub mod quoted_u64_opt {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<u64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&value.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            let value: Option<String> = Option::deserialize(deserializer)?;
            value
                .map(|s| s.parse().map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    /// Wei-denominated block values on the v3 production response.
    pub mod quoted_u128 {
        use super::*;

        pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

use serde_helpers::{quoted_u64_opt, root_hex};

/// Consensus fork, ordered oldest to newest.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ForkVersion {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
}

impl ForkVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForkVersion::Phase0 => "phase0",
            ForkVersion::Altair => "altair",
            ForkVersion::Bellatrix => "bellatrix",
            ForkVersion::Capella => "capella",
            ForkVersion::Deneb => "deneb",
            ForkVersion::Electra => "electra",
        }
    }
}

impl fmt::Display for ForkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase0" => Ok(ForkVersion::Phase0),
            "altair" => Ok(ForkVersion::Altair),
            "bellatrix" => Ok(ForkVersion::Bellatrix),
            "capella" => Ok(ForkVersion::Capella),
            "deneb" => Ok(ForkVersion::Deneb),
            "electra" => Ok(ForkVersion::Electra),
            other => Err(format!("unknown consensus version {other}")),
        }
    }
}

/// A 20-byte execution-layer address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExecutionAddress(pub [u8; 20]);

impl ExecutionAddress {
    pub fn zero() -> Self {
        ExecutionAddress([0; 20])
    }
}

impl fmt::Display for ExecutionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for ExecutionAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").ok_or("address must be 0x-prefixed")?;
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| "address must be 20 bytes".to_string())?;
        Ok(ExecutionAddress(arr))
    }
}

impl Serialize for ExecutionAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExecutionAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl TreeHash for ExecutionAddress {
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

/// Aggregation or committee bits rendered as 0x-hex on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Bits(pub Vec<u8>);

impl Bits {
    /// Returns the indices of all set bits, little-endian within each byte.
    pub fn bit_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for (byte_idx, byte) in self.0.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    indices.push(byte_idx * 8 + bit);
                }
            }
        }
        indices
    }

    /// Returns a bitfield of `len` bits with exactly one bit set.
    pub fn single(len: usize, index: usize) -> Self {
        let mut bytes = vec![0u8; len.div_ceil(8)];
        bytes[index / 8] |= 1 << (index % 8);
        Bits(bytes)
    }
}

impl Serialize for Bits {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Bits {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s
            .strip_prefix("0x")
            .ok_or_else(|| serde::de::Error::custom("bits must be 0x-prefixed"))?;
        let bytes = hex::decode(stripped).map_err(serde::de::Error::custom)?;
        Ok(Bits(bytes))
    }
}

impl TreeHash for Bits {
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

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, TreeHash)]
pub struct Checkpoint {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
    #[serde(with = "root_hex")]
    pub root: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, TreeHash)]
pub struct AttestationData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "root_hex")]
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub aggregation_bits: Bits,
    pub data: AttestationData,
    pub signature: Signature,
    /// Present from Electra onwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committee_bits: Option<Bits>,
}

impl TreeHash for Attestation {
    fn tree_hash_type() -> TreeHashType {
        TreeHashType::Container
    }

    fn tree_hash_packed_encoding(&self) -> PackedEncoding {
        unreachable!("Container should never be packed.")
    }

    fn tree_hash_packing_factor() -> usize {
        unreachable!("Container should never be packed.")
    }

    fn tree_hash_root(&self) -> Hash256 {
        let mut leaves = Vec::with_capacity(4 * 32);
        leaves.extend_from_slice(self.aggregation_bits.tree_hash_root().as_slice());
        leaves.extend_from_slice(self.data.tree_hash_root().as_slice());
        leaves.extend_from_slice(self.signature.tree_hash_root().as_slice());
        if let Some(committee_bits) = &self.committee_bits {
            leaves.extend_from_slice(committee_bits.tree_hash_root().as_slice());
        }
        tree_hash::merkle_root(&leaves, 0)
    }
}

/// An attestation with its fork made explicit. Pre-Electra attestations do
/// not carry the validator index; Electra ones do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedAttestation {
    pub version: ForkVersion,
    #[serde(default, with = "quoted_u64_opt", skip_serializing_if = "Option::is_none")]
    pub validator_index: Option<u64>,
    pub attestation: Attestation,
}

impl VersionedAttestation {
    pub fn data(&self) -> &AttestationData {
        &self.attestation.data
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct AggregateAndProof {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: u64,
    pub aggregate: Attestation,
    pub selection_proof: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAggregateAndProof {
    pub version: ForkVersion,
    pub message: AggregateAndProof,
    pub signature: Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeMessage {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "root_hex")]
    pub beacon_block_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct SyncCommitteeContribution {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "root_hex")]
    pub beacon_block_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: u64,
    pub aggregation_bits: Bits,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct ContributionAndProof {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: u64,
    pub contribution: SyncCommitteeContribution,
    pub selection_proof: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedContributionAndProof {
    pub message: ContributionAndProof,
    pub signature: Signature,
}

/// Signing input for sync-committee aggregator selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct SyncAggregatorSelectionData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct VoluntaryExit {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct ValidatorRegistration {
    pub fee_recipient: ExecutionAddress,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    pub pubkey: PubKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedValidatorRegistration {
    pub message: ValidatorRegistration,
    pub signature: Signature,
}

/// A partial or aggregated beacon-committee selection proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconCommitteeSelection {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    pub selection_proof: Signature,
}

/// A partial or aggregated sync-committee selection proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeSelection {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: u64,
    pub selection_proof: Signature,
}

/// The randao reveal: a signature over an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEpoch {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
    pub signature: Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct BlockBody {
    pub randao_reveal: Signature,
    #[serde(with = "root_hex")]
    pub graffiti: Hash256,
    pub fee_recipient: ExecutionAddress,
    /// Root of the execution payload (or payload header when blinded).
    #[serde(with = "root_hex")]
    pub execution_payload_root: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct BeaconBlock {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    #[serde(with = "root_hex")]
    pub parent_root: Hash256,
    #[serde(with = "root_hex")]
    pub state_root: Hash256,
    pub body: BlockBody,
}

/// Beacon-API validator status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
}

impl ValidatorStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ValidatorStatus::ActiveOngoing
                | ValidatorStatus::ActiveExiting
                | ValidatorStatus::ActiveSlashed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub pubkey: PubKey,
}

/// One entry of the beacon-node `validators` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub status: ValidatorStatus,
    pub validator: ValidatorInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttesterDuty {
    pub pubkey: PubKey,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_length: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committees_at_slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_committee_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerDuty {
    pub pubkey: PubKey,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeDuty {
    pub pubkey: PubKey,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validator_sync_committee_indices: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(epoch: u64) -> Checkpoint {
        Checkpoint {
            epoch,
            root: Hash256::repeat_byte(epoch as u8),
        }
    }

    fn att_data() -> AttestationData {
        AttestationData {
            slot: 32,
            index: 0,
            beacon_block_root: Hash256::repeat_byte(3),
            source: checkpoint(0),
            target: checkpoint(1),
        }
    }

    #[test]
    fn attestation_data_json_uses_quoted_numbers() {
        let json = serde_json::to_value(att_data()).unwrap();
        assert_eq!(json["slot"], "32");
        assert_eq!(json["index"], "0");
        assert!(json["beacon_block_root"]
            .as_str()
            .unwrap()
            .starts_with("0x0303"));
    }

    #[test]
    fn attestation_data_root_is_stable() {
        assert_eq!(att_data().tree_hash_root(), att_data().tree_hash_root());
        let mut other = att_data();
        other.slot += 1;
        assert_ne!(att_data().tree_hash_root(), other.tree_hash_root());
    }

    #[test]
    fn bits_single_and_indices() {
        let bits = Bits::single(16, 9);
        assert_eq!(bits.0.len(), 2);
        assert_eq!(bits.bit_indices(), vec![9]);
    }

    #[test]
    fn committee_bits_change_attestation_root() {
        let att = Attestation {
            aggregation_bits: Bits::single(8, 0),
            data: att_data(),
            signature: Signature::default(),
            committee_bits: None,
        };
        let mut electra = att.clone();
        electra.committee_bits = Some(Bits::single(64, 2));
        assert_ne!(att.tree_hash_root(), electra.tree_hash_root());
    }

    #[test]
    fn fork_version_round_trip() {
        for version in [
            ForkVersion::Phase0,
            ForkVersion::Altair,
            ForkVersion::Bellatrix,
            ForkVersion::Capella,
            ForkVersion::Deneb,
            ForkVersion::Electra,
        ] {
            assert_eq!(version.as_str().parse::<ForkVersion>().unwrap(), version);
        }
        assert!(ForkVersion::Deneb < ForkVersion::Electra);
    }

    #[test]
    fn execution_address_round_trip() {
        let addr: ExecutionAddress = "0x000000000000000000000000000000000000dead"
            .parse()
            .unwrap();
        assert_eq!(addr.to_string(), "0x000000000000000000000000000000000000dead");
    }

    #[test]
    fn versioned_attestation_omits_absent_index() {
        let att = VersionedAttestation {
            version: ForkVersion::Deneb,
            validator_index: None,
            attestation: Attestation {
                aggregation_bits: Bits::single(8, 1),
                data: att_data(),
                signature: Signature::default(),
                committee_bits: None,
            },
        };
        let json = serde_json::to_value(&att).unwrap();
        assert!(json.get("validator_index").is_none());
        assert_eq!(json["version"], "deneb");
    }
}
