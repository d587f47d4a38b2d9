//! Data-driven in-memory [`BeaconApi`] used by tests across the workspace.
//!
//! Responses are synthesized deterministically where possible so that every
//! operator node in a simulated cluster observes identical data, and all
//! submissions are recorded for assertions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tree_hash::Hash256;

use crate::{BeaconApi, BeaconError, Genesis, SyncStatus};
use dv_types::eth::{
    AttestationData, AttesterDuty, BeaconBlock, BlockBody, Checkpoint, ForkVersion, ProposerDuty,
    SignedAggregateAndProof, SignedContributionAndProof, SignedValidatorRegistration,
    SignedVoluntaryExit, SyncCommitteeContribution, SyncCommitteeDuty, SyncCommitteeMessage,
    Validator, VersionedAttestation,
};
use dv_types::signed::SignedProposal;
use dv_types::{Proposal, PubKey, Signature};

#[derive(Default)]
pub struct Submitted {
    pub attestations: Vec<VersionedAttestation>,
    pub proposals: Vec<SignedProposal>,
    pub aggregates: Vec<SignedAggregateAndProof>,
    pub sync_messages: Vec<SyncCommitteeMessage>,
    pub contributions: Vec<SignedContributionAndProof>,
    pub exits: Vec<SignedVoluntaryExit>,
    pub registrations: Vec<SignedValidatorRegistration>,
}

pub struct MockBeacon {
    pub genesis: Genesis,
    pub validators: Mutex<Vec<Validator>>,
    pub attester_duties: Mutex<Vec<AttesterDuty>>,
    pub proposer_duties: Mutex<Vec<ProposerDuty>>,
    pub sync_duties: Mutex<Vec<SyncCommitteeDuty>>,
    pub aggregate: Mutex<Option<VersionedAttestation>>,
    pub contribution: Mutex<Option<SyncCommitteeContribution>>,
    pub submitted: Mutex<Submitted>,
    /// Fail `validators` queries for slot-keyed states, forcing head
    /// fallback.
    pub fail_validators_by_slot: AtomicBool,
    /// Fail every submission with a 503 this many times before succeeding.
    pub submit_failures: AtomicUsize,
    pub validators_calls: AtomicUsize,
    pub att_data_calls: AtomicUsize,
    pub aggregate_calls: AtomicUsize,
}

impl Default for MockBeacon {
    fn default() -> Self {
        MockBeacon {
            genesis: Genesis {
                genesis_time: 0,
                genesis_validators_root: Hash256::repeat_byte(0x47),
            },
            validators: Mutex::new(Vec::new()),
            attester_duties: Mutex::new(Vec::new()),
            proposer_duties: Mutex::new(Vec::new()),
            sync_duties: Mutex::new(Vec::new()),
            aggregate: Mutex::new(None),
            contribution: Mutex::new(None),
            submitted: Mutex::new(Submitted::default()),
            fail_validators_by_slot: AtomicBool::new(false),
            submit_failures: AtomicUsize::new(0),
            validators_calls: AtomicUsize::new(0),
            att_data_calls: AtomicUsize::new(0),
            aggregate_calls: AtomicUsize::new(0),
        }
    }
}

impl MockBeacon {
    pub fn with_validator(self, index: u64, pubkey: PubKey) -> Self {
        self.validators.lock().push(Validator {
            index,
            status: dv_types::eth::ValidatorStatus::ActiveOngoing,
            validator: dv_types::eth::ValidatorInfo { pubkey },
        });
        self
    }

    /// Deterministic attestation data derived from slot and committee, so
    /// independent fetchers agree.
    pub fn att_data(slot: u64, committee_index: u64) -> AttestationData {
        AttestationData {
            slot,
            index: committee_index,
            beacon_block_root: Hash256::repeat_byte((slot % 250) as u8),
            source: Checkpoint {
                epoch: slot / dv_types::SLOTS_PER_EPOCH,
                root: Hash256::repeat_byte(1),
            },
            target: Checkpoint {
                epoch: slot / dv_types::SLOTS_PER_EPOCH + 1,
                root: Hash256::repeat_byte(2),
            },
        }
    }

    /// Deterministic proposal for the slot.
    pub fn proposal(slot: u64, randao_reveal: Signature) -> Proposal {
        Proposal {
            version: ForkVersion::Deneb,
            blinded: false,
            block: BeaconBlock {
                slot,
                proposer_index: 0,
                parent_root: Hash256::repeat_byte((slot % 250) as u8),
                state_root: Hash256::repeat_byte(0x51),
                body: BlockBody {
                    randao_reveal,
                    graffiti: Hash256::ZERO,
                    fee_recipient: Default::default(),
                    execution_payload_root: Hash256::repeat_byte(0x52),
                },
            },
            execution_payload_value: 1_000,
            consensus_block_value: 2_000,
        }
    }

    fn maybe_fail_submit(&self) -> Result<(), BeaconError> {
        let remaining = self.submit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.submit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BeaconError::Api {
                status: 503,
                message: "mock submission failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BeaconApi for MockBeacon {
    async fn genesis(&self) -> Result<Genesis, BeaconError> {
        Ok(self.genesis)
    }

    async fn node_version(&self) -> Result<String, BeaconError> {
        Ok("mock/v0".into())
    }

    async fn node_syncing(&self) -> Result<SyncStatus, BeaconError> {
        Ok(SyncStatus {
            head_slot: 0,
            is_syncing: false,
        })
    }

    async fn validators(
        &self,
        state_id: &str,
        pubkeys: &[PubKey],
    ) -> Result<Vec<Validator>, BeaconError> {
        self.validators_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_validators_by_slot.load(Ordering::SeqCst) && state_id != "head" {
            return Err(BeaconError::Api {
                status: 503,
                message: "state unavailable".into(),
            });
        }
        Ok(self
            .validators
            .lock()
            .iter()
            .filter(|validator| pubkeys.contains(&validator.validator.pubkey))
            .copied()
            .collect())
    }

    async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, BeaconError> {
        Ok(self
            .attester_duties
            .lock()
            .iter()
            .filter(|duty| {
                duty.slot / dv_types::SLOTS_PER_EPOCH == epoch
                    && indices.contains(&duty.validator_index)
            })
            .copied()
            .collect())
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, BeaconError> {
        Ok(self
            .proposer_duties
            .lock()
            .iter()
            .filter(|duty| duty.slot / dv_types::SLOTS_PER_EPOCH == epoch)
            .copied()
            .collect())
    }

    async fn sync_committee_duties(
        &self,
        _epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<SyncCommitteeDuty>, BeaconError> {
        Ok(self
            .sync_duties
            .lock()
            .iter()
            .filter(|duty| indices.contains(&duty.validator_index))
            .cloned()
            .collect())
    }

    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError> {
        self.att_data_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::att_data(slot, committee_index))
    }

    async fn produce_proposal(
        &self,
        slot: u64,
        randao_reveal: Signature,
        _graffiti: Option<Hash256>,
        _builder_boost_factor: u64,
    ) -> Result<Proposal, BeaconError> {
        Ok(Self::proposal(slot, randao_reveal))
    }

    async fn aggregate_attestation(
        &self,
        _slot: u64,
        _att_data_root: Hash256,
        _committee_index: u64,
    ) -> Result<Option<VersionedAttestation>, BeaconError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.aggregate.lock().clone())
    }

    async fn sync_committee_contribution(
        &self,
        _slot: u64,
        _subcommittee_index: u64,
        _beacon_block_root: Hash256,
    ) -> Result<Option<SyncCommitteeContribution>, BeaconError> {
        Ok(self.contribution.lock().clone())
    }

    async fn submit_attestations(
        &self,
        attestations: &[VersionedAttestation],
    ) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted
            .lock()
            .attestations
            .extend(attestations.iter().cloned());
        Ok(())
    }

    async fn submit_proposal(&self, proposal: &SignedProposal) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted.lock().proposals.push(proposal.clone());
        Ok(())
    }

    async fn submit_aggregates(
        &self,
        aggregates: &[SignedAggregateAndProof],
    ) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted
            .lock()
            .aggregates
            .extend(aggregates.iter().cloned());
        Ok(())
    }

    async fn submit_sync_messages(
        &self,
        messages: &[SyncCommitteeMessage],
    ) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted
            .lock()
            .sync_messages
            .extend(messages.iter().copied());
        Ok(())
    }

    async fn submit_contributions(
        &self,
        contributions: &[SignedContributionAndProof],
    ) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted
            .lock()
            .contributions
            .extend(contributions.iter().cloned());
        Ok(())
    }

    async fn submit_voluntary_exit(&self, exit: &SignedVoluntaryExit) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted.lock().exits.push(*exit);
        Ok(())
    }

    async fn register_validators(
        &self,
        registrations: &[SignedValidatorRegistration],
    ) -> Result<(), BeaconError> {
        self.maybe_fail_submit()?;
        self.submitted
            .lock()
            .registrations
            .extend(registrations.iter().copied());
        Ok(())
    }
}
