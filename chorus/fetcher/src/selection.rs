//! Aggregator selection checks over threshold selection proofs.
//!
//! A validator aggregates when the first eight bytes of the SHA-256 of its
//! aggregated selection proof are divisible by the committee's modulo.

use sha2::{Digest, Sha256};

use dv_types::Signature;

const TARGET_AGGREGATORS_PER_COMMITTEE: u64 = 16;
const SYNC_COMMITTEE_SIZE: u64 = 512;
const SYNC_COMMITTEE_SUBNET_COUNT: u64 = 4;
const TARGET_AGGREGATORS_PER_SYNC_SUBCOMMITTEE: u64 = 16;

/// Whether the selection proof makes its validator the aggregator for a
/// beacon committee of the given length.
pub fn is_att_aggregator(committee_length: u64, selection_proof: &Signature) -> bool {
    let modulo = (committee_length / TARGET_AGGREGATORS_PER_COMMITTEE).max(1);
    hash_mod(selection_proof, modulo)
}

/// Whether the selection proof makes its validator a sync-committee
/// aggregator for its subcommittee.
pub fn is_sync_comm_aggregator(selection_proof: &Signature) -> bool {
    let modulo = (SYNC_COMMITTEE_SIZE / SYNC_COMMITTEE_SUBNET_COUNT
        / TARGET_AGGREGATORS_PER_SYNC_SUBCOMMITTEE)
        .max(1);
    hash_mod(selection_proof, modulo)
}

fn hash_mod(selection_proof: &Signature, modulo: u64) -> bool {
    let digest = Sha256::digest(selection_proof.as_bytes());
    let value = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    value % modulo == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_committees_always_aggregate() {
        // committee_length < 16 gives modulo 1.
        assert!(is_att_aggregator(1, &Signature([3; 96])));
        assert!(is_att_aggregator(15, &Signature([0xff; 96])));
    }

    #[test]
    fn selection_is_deterministic() {
        let proof = Signature([0x42; 96]);
        assert_eq!(
            is_att_aggregator(128, &proof),
            is_att_aggregator(128, &proof)
        );
        assert_eq!(
            is_sync_comm_aggregator(&proof),
            is_sync_comm_aggregator(&proof)
        );
    }
}
