//! Core validator-API logic: pubshare translation, blocking data lookups and
//! partial-signature intake.
//!
//! The component presents the beacon-node surface to validator clients. Duty
//! endpoints replace group public keys with this operator's public share so
//! the client signs with its share; data endpoints block until the cluster
//! has agreed on a value; submission endpoints convert the client's share
//! signature into a partial signature, verify it, and hand it to the
//! partial-signature subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use tracing::{debug, warn};
use tree_hash::TreeHash;

use beacon_client::{BeaconApi, ValidatorCache};
use dv_types::eth::{
    AttestationData, Attestation, AttesterDuty, BeaconBlock, BeaconCommitteeSelection,
    ForkVersion, ProposerDuty, SignedAggregateAndProof, SignedContributionAndProof,
    SignedEpoch, SignedValidatorRegistration, SignedVoluntaryExit, SyncCommitteeContribution,
    SyncCommitteeDuty, SyncCommitteeMessage, SyncCommitteeSelection, Validator,
    ValidatorRegistration, VersionedAttestation,
};
use dv_types::signed::SignedProposal;
use dv_types::signing::{signing_root_for, ForkInfo};
use dv_types::{
    Duty, DutyDefinition, DutyDefinitionSet, ParSignedData, ParSignedDataSet, Proposal, PubKey,
    Root, Signature, SignedData, SLOTS_PER_EPOCH,
};

use crate::error::ApiError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type AwaitAttDataFn = Box<
    dyn Fn(u64, u64) -> BoxFuture<'static, Result<AttestationData, BoxError>> + Send + Sync,
>;
pub type AwaitProposalFn =
    Box<dyn Fn(u64) -> BoxFuture<'static, Result<Proposal, BoxError>> + Send + Sync>;
pub type AwaitAggAttFn = Box<
    dyn Fn(u64, Root) -> BoxFuture<'static, Result<VersionedAttestation, BoxError>> + Send + Sync,
>;
pub type AwaitSyncContributionFn = Box<
    dyn Fn(u64, u64, Root) -> BoxFuture<'static, Result<SyncCommitteeContribution, BoxError>>
        + Send
        + Sync,
>;
pub type AwaitAggSigFn =
    Box<dyn Fn(Duty, PubKey) -> BoxFuture<'static, Result<SignedData, BoxError>> + Send + Sync>;
pub type PubkeyByAttFn =
    Box<dyn Fn(u64, u64, u64) -> BoxFuture<'static, Result<PubKey, BoxError>> + Send + Sync>;
pub type DutyDefFn = Box<
    dyn Fn(Duty) -> BoxFuture<'static, Result<DutyDefinitionSet, BoxError>> + Send + Sync,
>;
pub type ParSigSubscriber =
    Box<dyn Fn(Duty, ParSignedDataSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// One validator of the cluster: its group key and the public shares of all
/// operators, ordered by share index (1-indexed).
#[derive(Clone, Debug)]
pub struct ClusterValidator {
    pub group_pubkey: PubKey,
    pub pubshares: Vec<PubKey>,
}

pub struct Component {
    eth2: Arc<dyn BeaconApi>,
    val_cache: Arc<ValidatorCache>,
    share_idx: u64,
    insecure_test: bool,
    builder_enabled: bool,
    target_gas_limit: u64,
    fee_recipient: Box<dyn Fn(PubKey) -> dv_types::eth::ExecutionAddress + Send + Sync>,
    fork_info: ForkInfo,
    genesis_time: u64,
    slot_duration: Duration,

    /// This operator's public share by group key.
    pubshare_by_key: HashMap<PubKey, PubKey>,
    /// Group key by this operator's public share.
    key_by_pubshare: HashMap<PubKey, PubKey>,
    /// Any operator's public share mapped to `(group key, share index)`,
    /// used to diagnose clients configured against the wrong operator.
    all_pubshares: HashMap<PubKey, (PubKey, u64)>,

    await_att_data: Option<AwaitAttDataFn>,
    await_proposal: Option<AwaitProposalFn>,
    await_agg_att: Option<AwaitAggAttFn>,
    await_sync_contribution: Option<AwaitSyncContributionFn>,
    await_agg_sig: Option<AwaitAggSigFn>,
    pubkey_by_attestation: Option<PubkeyByAttFn>,
    duty_def: Option<DutyDefFn>,
    subscribers: Vec<ParSigSubscriber>,
}

impl Component {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        eth2: Arc<dyn BeaconApi>,
        val_cache: Arc<ValidatorCache>,
        validators: &[ClusterValidator],
        share_idx: u64,
        fee_recipient: Box<dyn Fn(PubKey) -> dv_types::eth::ExecutionAddress + Send + Sync>,
        builder_enabled: bool,
        target_gas_limit: u64,
        fork_info: ForkInfo,
        genesis_time: u64,
        slot_duration: Duration,
        insecure_test: bool,
    ) -> Self {
        let mut pubshare_by_key = HashMap::new();
        let mut key_by_pubshare = HashMap::new();
        let mut all_pubshares = HashMap::new();

        for validator in validators {
            for (i, pubshare) in validator.pubshares.iter().enumerate() {
                all_pubshares.insert(*pubshare, (validator.group_pubkey, i as u64 + 1));
            }
            let own = validator.pubshares[share_idx as usize - 1];
            pubshare_by_key.insert(validator.group_pubkey, own);
            key_by_pubshare.insert(own, validator.group_pubkey);
        }

        Component {
            eth2,
            val_cache,
            share_idx,
            insecure_test,
            builder_enabled,
            target_gas_limit,
            fee_recipient,
            fork_info,
            genesis_time,
            slot_duration,
            pubshare_by_key,
            key_by_pubshare,
            all_pubshares,
            await_att_data: None,
            await_proposal: None,
            await_agg_att: None,
            await_sync_contribution: None,
            await_agg_sig: None,
            pubkey_by_attestation: None,
            duty_def: None,
            subscribers: Vec::new(),
        }
    }

    // Registration is single-threaded wiring; all of it must complete before
    // the first request is served.

    pub fn register_await_att_data(&mut self, f: AwaitAttDataFn) {
        self.await_att_data = Some(f);
    }

    pub fn register_await_proposal(&mut self, f: AwaitProposalFn) {
        self.await_proposal = Some(f);
    }

    pub fn register_await_agg_attestation(&mut self, f: AwaitAggAttFn) {
        self.await_agg_att = Some(f);
    }

    pub fn register_await_sync_contribution(&mut self, f: AwaitSyncContributionFn) {
        self.await_sync_contribution = Some(f);
    }

    pub fn register_await_agg_sig(&mut self, f: AwaitAggSigFn) {
        self.await_agg_sig = Some(f);
    }

    pub fn register_pubkey_by_attestation(&mut self, f: PubkeyByAttFn) {
        self.pubkey_by_attestation = Some(f);
    }

    pub fn register_duty_definition(&mut self, f: DutyDefFn) {
        self.duty_def = Some(f);
    }

    pub fn subscribe(&mut self, subscriber: ParSigSubscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn current_slot(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        beacon_client::slot_from_timestamp(self.genesis_time, self.slot_duration, now)
    }

    /// Timestamp pinned to genesis plus one slot, overriding pre-generated
    /// registrations.
    fn registration_timestamp(&self) -> u64 {
        self.genesis_time + self.slot_duration.as_secs()
    }

    // ---- duty endpoints ----

    pub async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, ApiError> {
        let mut duties = self
            .eth2
            .attester_duties(epoch, indices)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        for duty in &mut duties {
            duty.pubkey = self.to_pubshare(duty.pubkey);
        }
        Ok(duties)
    }

    pub async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, ApiError> {
        let mut duties = self
            .eth2
            .proposer_duties(epoch)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        for duty in &mut duties {
            duty.pubkey = self.to_pubshare(duty.pubkey);
        }
        Ok(duties)
    }

    pub async fn sync_committee_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<SyncCommitteeDuty>, ApiError> {
        let mut duties = self
            .eth2
            .sync_committee_duties(epoch, indices)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        for duty in &mut duties {
            duty.pubkey = self.to_pubshare(duty.pubkey);
        }
        Ok(duties)
    }

    // ---- data-producing endpoints (blocking) ----

    pub async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, ApiError> {
        let await_fn = self.await_att_data.as_ref().expect("wired before serving");
        await_fn(slot, committee_index)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    /// Produces the agreed block for the slot. The randao reveal submitted by
    /// the validator client is itself a partial signature, injected into the
    /// pipeline before blocking on the proposal.
    pub async fn produce_proposal(
        &self,
        slot: u64,
        randao_reveal: Signature,
    ) -> Result<Proposal, ApiError> {
        let pubkey = self.proposer_pubkey(slot).await?;

        let epoch = slot / SLOTS_PER_EPOCH;
        let parsig = ParSignedData::new(
            SignedData::Randao(SignedEpoch {
                epoch,
                signature: randao_reveal,
            }),
            self.share_idx,
        );
        self.verify_par_sig(pubkey, &parsig)?;
        self.publish(Duty::randao(slot), pubkey, parsig).await?;

        let await_fn = self.await_proposal.as_ref().expect("wired before serving");
        await_fn(slot).await.map_err(|e| ApiError::internal(e.to_string()))
    }

    /// Accepts the signed (possibly blinded) proposal from the validator
    /// client, cross-checking it against the agreed proposal.
    pub async fn submit_proposal(
        &self,
        blinded: bool,
        version: ForkVersion,
        message: BeaconBlock,
        signature: Signature,
    ) -> Result<(), ApiError> {
        let slot = message.slot;
        let pubkey = self.proposer_pubkey(slot).await?;

        let stored = {
            let await_fn = self.await_proposal.as_ref().expect("wired before serving");
            await_fn(slot).await.map_err(|e| ApiError::internal(e.to_string()))?
        };
        prop_data_matches_duty(&stored, blinded, version, &message)?;

        let parsig = ParSignedData::new(
            SignedData::Proposal(SignedProposal {
                version,
                blinded,
                message,
                signature,
            }),
            self.share_idx,
        );
        self.verify_par_sig(pubkey, &parsig)?;
        self.publish(Duty::proposer(slot), pubkey, parsig).await
    }

    /// Accepts partially signed attestations, resolving each to its
    /// validator and grouping them per slot.
    pub async fn submit_attestations(
        &self,
        attestations: Vec<(Attestation, Option<u64>)>,
        version: ForkVersion,
    ) -> Result<(), ApiError> {
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for (attestation, submitted_index) in attestations {
            let slot = attestation.data.slot;
            let committee_index = attestation.data.index;

            let validator_index = if version >= ForkVersion::Electra {
                submitted_index.ok_or_else(|| {
                    ApiError::bad_request(
                        "missing attestation validator index from electra attestation",
                    )
                })?
            } else {
                self.pre_electra_validator_index(&attestation).await?
            };

            let lookup = self
                .pubkey_by_attestation
                .as_ref()
                .expect("wired before serving");
            let pubkey = lookup(slot, committee_index, validator_index)
                .await
                .map_err(|e| ApiError::bad_request(e.to_string()))?;

            let parsig = ParSignedData::new(
                SignedData::Attestation(VersionedAttestation {
                    version,
                    validator_index: Some(validator_index),
                    attestation,
                }),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot.entry(slot).or_default().insert(pubkey, parsig);
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::attester(slot), set).await?;
        }
        Ok(())
    }

    /// Pre-electra attestations carry no validator index; it is recovered by
    /// matching the single aggregation bit against the attester duty.
    async fn pre_electra_validator_index(
        &self,
        attestation: &Attestation,
    ) -> Result<u64, ApiError> {
        let duty_def = self.duty_def.as_ref().expect("wired before serving");
        let def_set = duty_def(Duty::attester(attestation.data.slot))
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

        let indices = attestation.aggregation_bits.bit_indices();
        if indices.len() != 1 {
            return Err(ApiError::bad_request(format!(
                "unexpected number of aggregation bits [0x{}]",
                hex::encode(&attestation.aggregation_bits.0)
            )));
        }

        for definition in def_set.values() {
            let DutyDefinition::Attester(duty) = definition else {
                continue;
            };
            if duty.committee_index == attestation.data.index
                && duty.validator_committee_index == indices[0] as u64
            {
                return Ok(duty.validator_index);
            }
        }

        Err(ApiError::bad_request("failed to find pubkey"))
    }

    pub async fn aggregate_attestation(
        &self,
        slot: u64,
        att_data_root: Root,
    ) -> Result<VersionedAttestation, ApiError> {
        let await_fn = self.await_agg_att.as_ref().expect("wired before serving");
        await_fn(slot, att_data_root)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    pub async fn submit_aggregates(
        &self,
        version: ForkVersion,
        aggregates: Vec<(dv_types::eth::AggregateAndProof, Signature)>,
    ) -> Result<(), ApiError> {
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for (message, signature) in aggregates {
            let slot = message.aggregate.data.slot;
            let pubkey = self
                .pubkey_by_validator_index(Duty::aggregator(slot), message.aggregator_index)
                .await?;

            let parsig = ParSignedData::new(
                SignedData::AggregateAndProof(SignedAggregateAndProof {
                    version,
                    message,
                    signature,
                }),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot.entry(slot).or_default().insert(pubkey, parsig);
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::aggregator(slot), set).await?;
        }
        Ok(())
    }

    pub async fn sync_committee_contribution(
        &self,
        slot: u64,
        subcommittee_index: u64,
        beacon_block_root: Root,
    ) -> Result<SyncCommitteeContribution, ApiError> {
        let await_fn = self
            .await_sync_contribution
            .as_ref()
            .expect("wired before serving");
        await_fn(slot, subcommittee_index, beacon_block_root)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    pub async fn submit_sync_messages(
        &self,
        messages: Vec<SyncCommitteeMessage>,
    ) -> Result<(), ApiError> {
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for message in messages {
            let pubkey = self
                .pubkey_by_validator_index(
                    Duty::sync_message(message.slot),
                    message.validator_index,
                )
                .await?;
            let parsig = ParSignedData::new(SignedData::SyncMessage(message), self.share_idx);
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot
                .entry(message.slot)
                .or_default()
                .insert(pubkey, parsig);
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::sync_message(slot), set).await?;
        }
        Ok(())
    }

    pub async fn submit_contributions(
        &self,
        contributions: Vec<SignedContributionAndProof>,
    ) -> Result<(), ApiError> {
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for contribution in contributions {
            let slot = contribution.message.contribution.slot;
            let pubkey = self
                .pubkey_by_validator_index(
                    Duty::sync_contribution(slot),
                    contribution.message.aggregator_index,
                )
                .await?;
            let parsig = ParSignedData::new(
                SignedData::ContributionAndProof(contribution),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot.entry(slot).or_default().insert(pubkey, parsig);
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::sync_contribution(slot), set).await?;
        }
        Ok(())
    }

    pub async fn submit_voluntary_exit(&self, exit: SignedVoluntaryExit) -> Result<(), ApiError> {
        let (active, _) = self
            .val_cache
            .get_by_head()
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let pubkey = active
            .get(&exit.message.validator_index)
            .copied()
            .ok_or_else(|| ApiError::bad_request("unknown public key"))?;

        let slot = self.current_slot();
        let parsig = ParSignedData::new(SignedData::VoluntaryExit(exit), self.share_idx);
        self.verify_par_sig(pubkey, &parsig)?;
        self.publish(Duty::voluntary_exit(slot), pubkey, parsig).await
    }

    /// Accepts builder registrations. Registrations for pubkeys outside the
    /// cluster are swallowed with a debug log to stay compatible with
    /// validator clients that register their whole key list.
    pub async fn register_validators(
        &self,
        registrations: Vec<SignedValidatorRegistration>,
    ) -> Result<(), ApiError> {
        let slot = self.current_slot();
        let mut set = ParSignedDataSet::new();

        for registration in registrations {
            let pubkey = match self.key_by_pubshare.get(&registration.message.pubkey) {
                Some(pubkey) => *pubkey,
                None => {
                    if let Some((_, share_idx)) =
                        self.all_pubshares.get(&registration.message.pubkey)
                    {
                        return Err(ApiError::bad_request(format!(
                            "mismatching validator client key share index, key share {} submitted to operator {}",
                            share_idx, self.share_idx
                        )));
                    }
                    debug!(
                        pubkey = %registration.message.pubkey,
                        "Swallowing builder registration for unknown pubkey"
                    );
                    continue;
                }
            };

            // Pin the registration to the cluster identity: group pubkey and
            // the genesis-pinned timestamp served by proposer_config.
            let message = ValidatorRegistration {
                fee_recipient: registration.message.fee_recipient,
                gas_limit: registration.message.gas_limit,
                timestamp: self.registration_timestamp(),
                pubkey,
            };
            let parsig = ParSignedData::new(
                SignedData::ValidatorRegistration(SignedValidatorRegistration {
                    message,
                    signature: registration.signature,
                }),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            set.insert(pubkey, parsig);
        }

        if set.is_empty() {
            return Ok(());
        }
        self.publish_set(Duty::builder_registration(slot), set).await
    }

    // ---- selection aggregation endpoints ----

    pub async fn aggregate_beacon_committee_selections(
        &self,
        selections: Vec<BeaconCommitteeSelection>,
    ) -> Result<Vec<BeaconCommitteeSelection>, ApiError> {
        let mut keys = Vec::new();
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for selection in &selections {
            let pubkey = self.pubkey_by_index(selection.validator_index).await?;
            let parsig = ParSignedData::new(
                SignedData::BeaconCommitteeSelection(*selection),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot
                .entry(selection.slot)
                .or_default()
                .insert(pubkey, parsig);
            keys.push((Duty::prepare_aggregator(selection.slot), pubkey));
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::prepare_aggregator(slot), set).await?;
        }

        // Block until the cluster threshold produced each aggregate proof.
        let await_fn = self.await_agg_sig.as_ref().expect("wired before serving");
        let mut aggregated = Vec::with_capacity(keys.len());
        for (duty, pubkey) in keys {
            let data = await_fn(duty, pubkey)
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            let SignedData::BeaconCommitteeSelection(selection) = data else {
                return Err(ApiError::internal("unexpected aggregate data"));
            };
            aggregated.push(selection);
        }
        Ok(aggregated)
    }

    pub async fn aggregate_sync_committee_selections(
        &self,
        selections: Vec<SyncCommitteeSelection>,
    ) -> Result<Vec<SyncCommitteeSelection>, ApiError> {
        let mut keys = Vec::new();
        let mut sets_by_slot: BTreeMap<u64, ParSignedDataSet> = BTreeMap::new();

        for selection in &selections {
            let pubkey = self.pubkey_by_index(selection.validator_index).await?;
            let parsig = ParSignedData::new(
                SignedData::SyncCommitteeSelection(*selection),
                self.share_idx,
            );
            self.verify_par_sig(pubkey, &parsig)?;
            sets_by_slot
                .entry(selection.slot)
                .or_default()
                .insert(pubkey, parsig);
            keys.push((Duty::prepare_sync_contribution(selection.slot), pubkey));
        }

        for (slot, set) in sets_by_slot {
            self.publish_set(Duty::prepare_sync_contribution(slot), set)
                .await?;
        }

        let await_fn = self.await_agg_sig.as_ref().expect("wired before serving");
        let mut aggregated = Vec::with_capacity(keys.len());
        for (duty, pubkey) in keys {
            let data = await_fn(duty, pubkey)
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            let SignedData::SyncCommitteeSelection(selection) = data else {
                return Err(ApiError::internal("unexpected aggregate data"));
            };
            aggregated.push(selection);
        }
        Ok(aggregated)
    }

    // ---- validator lookup ----

    /// Serves the validators endpoint: requested pubshares are translated to
    /// group pubkeys before querying, and cluster validators in the response
    /// carry this operator's pubshare.
    pub async fn validators(
        &self,
        state_id: &str,
        ids: &[String],
    ) -> Result<Vec<Validator>, ApiError> {
        let mut pubkeys = Vec::new();
        let mut indices = Vec::new();

        for id in ids {
            if id.starts_with("0x") {
                let pubkey: PubKey = id
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid pubkey [{id}]")))?;
                pubkeys.push(self.from_pubshare(pubkey));
            } else {
                let index: u64 = id
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid validator id [{id}]")))?;
                indices.push(index);
            }
        }

        if !indices.is_empty() {
            let (active, _) = self
                .val_cache
                .get_by_head()
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            for index in indices {
                if let Some(pubkey) = active.get(&index) {
                    pubkeys.push(*pubkey);
                }
            }
        }

        if pubkeys.is_empty() {
            pubkeys = self.pubshare_by_key.keys().copied().collect();
        }

        let mut validators = self
            .eth2
            .validators(state_id, &pubkeys)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        for validator in &mut validators {
            validator.validator.pubkey = self.to_pubshare(validator.validator.pubkey);
        }
        Ok(validators)
    }

    /// Per-validator proposer configuration served to validator clients.
    pub fn proposer_config(&self) -> ProposerConfigResponse {
        let mut proposer_config = BTreeMap::new();
        for (group, pubshare) in &self.pubshare_by_key {
            proposer_config.insert(
                pubshare.to_string(),
                ProposerConfigEntry {
                    fee_recipient: (self.fee_recipient)(*group).to_string(),
                    builder: BuilderConfig {
                        enabled: self.builder_enabled,
                        gas_limit: self.target_gas_limit,
                        registration_overrides: Some(RegistrationOverrides {
                            timestamp: self.registration_timestamp(),
                            public_key: group.to_string(),
                        }),
                    },
                },
            );
        }
        ProposerConfigResponse {
            proposer_config,
            default_config: ProposerConfigEntry {
                fee_recipient: dv_types::eth::ExecutionAddress::zero().to_string(),
                builder: BuilderConfig {
                    enabled: false,
                    gas_limit: self.target_gas_limit,
                    registration_overrides: None,
                },
            },
        }
    }

    // ---- internals ----

    fn to_pubshare(&self, pubkey: PubKey) -> PubKey {
        self.pubshare_by_key.get(&pubkey).copied().unwrap_or(pubkey)
    }

    fn from_pubshare(&self, pubkey: PubKey) -> PubKey {
        self.key_by_pubshare.get(&pubkey).copied().unwrap_or(pubkey)
    }

    async fn proposer_pubkey(&self, slot: u64) -> Result<PubKey, ApiError> {
        let duty_def = self.duty_def.as_ref().expect("wired before serving");
        let def_set = duty_def(Duty::proposer(slot))
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        def_set
            .keys()
            .next()
            .copied()
            .ok_or_else(|| ApiError::bad_request("no proposer duty for slot"))
    }

    async fn pubkey_by_validator_index(
        &self,
        duty: Duty,
        validator_index: u64,
    ) -> Result<PubKey, ApiError> {
        let duty_def = self.duty_def.as_ref().expect("wired before serving");
        let def_set = duty_def(duty)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        for (pubkey, definition) in &def_set {
            if definition.validator_index() == validator_index {
                return Ok(*pubkey);
            }
        }
        Err(ApiError::bad_request("unknown public key"))
    }

    async fn pubkey_by_index(&self, validator_index: u64) -> Result<PubKey, ApiError> {
        let (active, _) = self
            .val_cache
            .get_by_head()
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        active
            .get(&validator_index)
            .copied()
            .ok_or_else(|| ApiError::bad_request("unknown public key"))
    }

    /// Verifies a partial signature against this operator's public share of
    /// the validator. Skipped in the documented insecure test mode.
    fn verify_par_sig(&self, pubkey: PubKey, parsig: &ParSignedData) -> Result<(), ApiError> {
        if self.insecure_test {
            return Ok(());
        }

        let pubshare = self
            .pubshare_by_key
            .get(&pubkey)
            .ok_or_else(|| ApiError::bad_request("unknown public key"))?;

        let root = signing_root_for(&parsig.data, &self.fork_info);
        let share_key = tbls::PublicKey::from_bytes(pubshare.as_bytes())
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let signature = tbls::Signature::from_bytes(parsig.signature().as_bytes())
            .map_err(|_| ApiError::bad_request("invalid signature"))?;

        if !tbls::verify(&share_key, root.as_slice(), &signature) {
            warn!(%pubkey, kind = parsig.data.kind_label(), "Partial signature failed verification");
            return Err(ApiError::bad_request("invalid partial signature"));
        }
        Ok(())
    }

    async fn publish(
        &self,
        duty: Duty,
        pubkey: PubKey,
        parsig: ParSignedData,
    ) -> Result<(), ApiError> {
        let mut set = ParSignedDataSet::new();
        set.insert(pubkey, parsig);
        self.publish_set(duty, set).await
    }

    async fn publish_set(&self, duty: Duty, set: ParSignedDataSet) -> Result<(), ApiError> {
        for subscriber in &self.subscribers {
            // Clone before calling each subscriber.
            subscriber(duty, set.clone())
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
        }
        Ok(())
    }
}

/// Cross-checks the submitted proposal against the agreed one: blinded flag,
/// version, proposer index and the hash tree root of the message must match
/// exactly.
pub fn prop_data_matches_duty(
    stored: &Proposal,
    blinded: bool,
    version: ForkVersion,
    message: &BeaconBlock,
) -> Result<(), ApiError> {
    if stored.blinded != blinded {
        return Err(ApiError::bad_request("blinded proposal flag mismatch"));
    }
    if stored.version != version {
        return Err(ApiError::bad_request("proposal version mismatch"));
    }
    if stored.block.proposer_index != message.proposer_index {
        return Err(ApiError::bad_request("proposal proposer index mismatch"));
    }
    if stored.message_root() != message.tree_hash_root() {
        return Err(ApiError::bad_request("proposal data does not match duty"));
    }
    Ok(())
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProposerConfigResponse {
    pub proposer_config: BTreeMap<String, ProposerConfigEntry>,
    pub default_config: ProposerConfigEntry,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProposerConfigEntry {
    pub fee_recipient: String,
    pub builder: BuilderConfig,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BuilderConfig {
    pub enabled: bool,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_overrides: Option<RegistrationOverrides>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RegistrationOverrides {
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    pub public_key: String,
}
