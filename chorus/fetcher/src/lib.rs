//! Fetches canonical unsigned duty data from the beacon node.
//!
//! For each emitted duty definition set this resolves the payload that the
//! cluster must agree on: attestation data (one fetch per committee),
//! proposals (requiring the aggregated randao reveal), aggregate attestations
//! (requiring a committee selection proof) and sync contributions (requiring
//! a sync selection proof and the agreed sync-message root).

mod graffiti;
mod selection;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use tree_hash::TreeHash;

use beacon_client::{BeaconApi, BeaconError};
use dv_types::eth::{ExecutionAddress, ForkVersion};
use dv_types::{
    Duty, DutyDefinition, DutyDefinitionSet, DutyKind, Proposal, PubKey, Root, SignedData,
    UnsignedAttestation, UnsignedData, UnsignedDataSet,
};

pub use graffiti::GraffitiBuilder;
pub use selection::{is_att_aggregator, is_sync_comm_aggregator};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Blocking lookup of an aggregated signature from the aggregate store.
pub type AwaitAggSigFn =
    Box<dyn Fn(Duty, PubKey) -> BoxFuture<'static, Result<SignedData, BoxError>> + Send + Sync>;

/// Blocking lookup of decided attestation data from the duty store.
pub type AwaitAttDataFn = Box<
    dyn Fn(u64, u64) -> BoxFuture<'static, Result<dv_types::eth::AttestationData, BoxError>>
        + Send
        + Sync,
>;

pub type UnsignedSubscriber =
    Box<dyn Fn(Duty, UnsignedDataSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Resolves the configured fee recipient for a validator.
pub type FeeRecipientFn = Box<dyn Fn(PubKey) -> ExecutionAddress + Send + Sync>;

#[derive(Debug)]
pub enum FetchError {
    Beacon(BeaconError),
    /// The beacon node does not know the aggregate for this root yet;
    /// retried on the next slot tick until the duty deadline.
    AggregateNotFound { root: Root },
    /// Same, for sync contributions.
    ContributionNotFound { subcommittee_index: u64, root: Root },
    InvalidDefinition { duty: Duty },
    InvalidSignedData { duty: Duty },
    DeprecatedBuilderProposer,
    UnsupportedDuty { duty: Duty },
    Await(BoxError),
    Subscriber(BoxError),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Beacon(err) => write!(f, "beacon fetch failed: {err}"),
            FetchError::AggregateNotFound { root } => {
                write!(f, "aggregate attestation not found by root (retryable): {root}")
            }
            FetchError::ContributionNotFound {
                subcommittee_index,
                root,
            } => write!(
                f,
                "sync contribution not found by root (retryable): subcommittee {subcommittee_index} root {root}"
            ),
            FetchError::InvalidDefinition { duty } => {
                write!(f, "invalid duty definition for {duty}")
            }
            FetchError::InvalidSignedData { duty } => {
                write!(f, "unexpected aggregate signed data for {duty}")
            }
            FetchError::DeprecatedBuilderProposer => {
                write!(f, "builder proposer duty is deprecated")
            }
            FetchError::UnsupportedDuty { duty } => write!(f, "unsupported duty type {duty}"),
            FetchError::Await(err) => write!(f, "awaiting prerequisite failed: {err}"),
            FetchError::Subscriber(err) => write!(f, "unsigned data subscriber failed: {err}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<BeaconError> for FetchError {
    fn from(err: BeaconError) -> Self {
        FetchError::Beacon(err)
    }
}

pub struct Fetcher {
    beacon: Arc<dyn BeaconApi>,
    fee_recipient: FeeRecipientFn,
    builder_enabled: bool,
    graffiti: GraffitiBuilder,
    await_agg_sig: Option<AwaitAggSigFn>,
    await_att_data: Option<AwaitAttDataFn>,
    subscribers: Vec<UnsignedSubscriber>,
}

impl Fetcher {
    pub fn new(
        beacon: Arc<dyn BeaconApi>,
        fee_recipient: FeeRecipientFn,
        builder_enabled: bool,
        graffiti: GraffitiBuilder,
    ) -> Self {
        Fetcher {
            beacon,
            fee_recipient,
            builder_enabled,
            graffiti,
            await_agg_sig: None,
            await_att_data: None,
            subscribers: Vec::new(),
        }
    }

    /// Registers the aggregate-store lookup. Not thread safe; call before the
    /// first fetch.
    pub fn register_agg_sig_db(&mut self, lookup: AwaitAggSigFn) {
        self.await_agg_sig = Some(lookup);
    }

    /// Registers the decided-attestation lookup. Not thread safe; call before
    /// the first fetch.
    pub fn register_await_att_data(&mut self, lookup: AwaitAttDataFn) {
        self.await_att_data = Some(lookup);
    }

    /// Registers a subscriber for fetched unsigned data sets. Not thread
    /// safe; call before the first fetch.
    pub fn subscribe(&mut self, subscriber: UnsignedSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Fetches the unsigned data set for one duty and hands it to the
    /// subscribers, cloning per subscriber.
    pub async fn fetch(&self, duty: Duty, def_set: DutyDefinitionSet) -> Result<(), FetchError> {
        let unsigned_set = match duty.kind {
            DutyKind::Attester => self.fetch_attester_data(duty.slot, &def_set).await?,
            DutyKind::Proposer => self.fetch_proposer_data(duty.slot, &def_set).await?,
            DutyKind::Aggregator => {
                let set = self.fetch_aggregator_data(duty.slot, &def_set).await?;
                if set.is_empty() {
                    // No aggregators selected in this slot.
                    return Ok(());
                }
                set
            }
            DutyKind::SyncContribution => {
                let set = self.fetch_contribution_data(duty.slot, &def_set).await?;
                if set.is_empty() {
                    return Ok(());
                }
                set
            }
            DutyKind::BuilderProposer => return Err(FetchError::DeprecatedBuilderProposer),
            _ => return Err(FetchError::UnsupportedDuty { duty }),
        };

        for subscriber in &self.subscribers {
            // Clone before calling each subscriber.
            subscriber(duty, unsigned_set.clone())
                .await
                .map_err(FetchError::Subscriber)?;
        }

        Ok(())
    }

    /// Multiple validators in the same committee share one attestation data
    /// payload, fetched once and indexed by committee index.
    ///
    /// Attestation data is nominally not bound by committee index from the
    /// Electra fork, but validator clients still query per committee index,
    /// so the fetch stays per-index until all supported clients ask for
    /// index zero only.
    async fn fetch_attester_data(
        &self,
        slot: u64,
        def_set: &DutyDefinitionSet,
    ) -> Result<UnsignedDataSet, FetchError> {
        let mut by_committee = HashMap::new();
        let mut resp = UnsignedDataSet::new();

        for (pubkey, definition) in def_set {
            let DutyDefinition::Attester(att_duty) = definition else {
                return Err(FetchError::InvalidDefinition {
                    duty: Duty::attester(slot),
                });
            };

            let committee_index = att_duty.committee_index;
            let data = match by_committee.get(&committee_index) {
                Some(data) => *data,
                None => {
                    let data = self.beacon.attestation_data(slot, committee_index).await?;
                    by_committee.insert(committee_index, data);
                    data
                }
            };

            resp.insert(
                *pubkey,
                UnsignedData::Attestation(UnsignedAttestation {
                    data,
                    duty: *att_duty,
                }),
            );
        }

        Ok(resp)
    }

    async fn fetch_proposer_data(
        &self,
        slot: u64,
        def_set: &DutyDefinitionSet,
    ) -> Result<UnsignedDataSet, FetchError> {
        let mut resp = UnsignedDataSet::new();

        for pubkey in def_set.keys() {
            // The aggregated randao reveal gates block production.
            let randao_data = self
                .await_agg_sig(Duty::randao(slot), *pubkey)
                .await?;
            let SignedData::Randao(randao) = randao_data else {
                return Err(FetchError::InvalidSignedData {
                    duty: Duty::randao(slot),
                });
            };

            // Maximum priority for builder blocks when the builder API is on.
            let builder_boost_factor = if self.builder_enabled { u64::MAX } else { 0 };

            let proposal = self
                .beacon
                .produce_proposal(
                    slot,
                    randao.signature,
                    self.graffiti.get(pubkey),
                    builder_boost_factor,
                )
                .await?;

            verify_fee_recipient(&proposal, (self.fee_recipient)(*pubkey));

            resp.insert(*pubkey, UnsignedData::Proposal(proposal));
        }

        Ok(resp)
    }

    async fn fetch_aggregator_data(
        &self,
        slot: u64,
        def_set: &DutyDefinitionSet,
    ) -> Result<UnsignedDataSet, FetchError> {
        let mut tracker = PubkeysTracker::new("attester aggregation");
        // Aggregators of the same committee share one aggregate.
        let mut by_committee: HashMap<u64, dv_types::eth::VersionedAttestation> = HashMap::new();
        let mut resp = UnsignedDataSet::new();

        for (pubkey, definition) in def_set {
            let DutyDefinition::Attester(att_duty) = definition else {
                return Err(FetchError::InvalidDefinition {
                    duty: Duty::aggregator(slot),
                });
            };

            // The aggregated selection proof decides whether this validator
            // aggregates for its committee.
            let selection_data = self
                .await_agg_sig(Duty::prepare_aggregator(slot), *pubkey)
                .await?;
            let SignedData::BeaconCommitteeSelection(selection) = selection_data else {
                return Err(FetchError::InvalidSignedData {
                    duty: Duty::prepare_aggregator(slot),
                });
            };

            if !is_att_aggregator(att_duty.committee_length, &selection.selection_proof) {
                tracker.not_selected(pubkey);
                continue;
            }
            tracker.resolved(pubkey);

            if let Some(aggregate) = by_committee.get(&att_duty.committee_index) {
                resp.insert(*pubkey, UnsignedData::AggregatedAttestation(aggregate.clone()));
                continue;
            }

            let att_data = self.await_att_data(slot, att_duty.committee_index).await?;
            let root = att_data.tree_hash_root();

            let Some(aggregate) = self
                .beacon
                .aggregate_attestation(slot, root, att_duty.committee_index)
                .await?
            else {
                // Some beacon nodes return nothing when the root is unknown,
                // e.g. when not subscribed to the right subnet.
                return Err(FetchError::AggregateNotFound { root });
            };

            by_committee.insert(att_duty.committee_index, aggregate.clone());
            resp.insert(*pubkey, UnsignedData::AggregatedAttestation(aggregate));
        }

        tracker.log();
        Ok(resp)
    }

    async fn fetch_contribution_data(
        &self,
        slot: u64,
        def_set: &DutyDefinitionSet,
    ) -> Result<UnsignedDataSet, FetchError> {
        let mut tracker = PubkeysTracker::new("sync committee contribution");
        let mut resp = UnsignedDataSet::new();

        for pubkey in def_set.keys() {
            let selection_data = self
                .await_agg_sig(Duty::prepare_sync_contribution(slot), *pubkey)
                .await?;
            let SignedData::SyncCommitteeSelection(selection) = selection_data else {
                return Err(FetchError::InvalidSignedData {
                    duty: Duty::prepare_sync_contribution(slot),
                });
            };

            if !is_sync_comm_aggregator(&selection.selection_proof) {
                tracker.not_selected(pubkey);
                continue;
            }

            // The agreed sync message supplies the block root to contribute
            // for.
            let message_data = self
                .await_agg_sig(Duty::sync_message(slot), *pubkey)
                .await?;
            let SignedData::SyncMessage(message) = message_data else {
                return Err(FetchError::InvalidSignedData {
                    duty: Duty::sync_message(slot),
                });
            };

            let Some(contribution) = self
                .beacon
                .sync_committee_contribution(
                    slot,
                    selection.subcommittee_index,
                    message.beacon_block_root,
                )
                .await?
            else {
                return Err(FetchError::ContributionNotFound {
                    subcommittee_index: selection.subcommittee_index,
                    root: message.beacon_block_root,
                });
            };

            tracker.resolved(pubkey);
            resp.insert(*pubkey, UnsignedData::SyncContribution(contribution));
        }

        tracker.log();
        Ok(resp)
    }

    async fn await_agg_sig(&self, duty: Duty, pubkey: PubKey) -> Result<SignedData, FetchError> {
        let lookup = self
            .await_agg_sig
            .as_ref()
            .expect("aggregate lookup registered before fetch");
        lookup(duty, pubkey).await.map_err(FetchError::Await)
    }

    async fn await_att_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<dv_types::eth::AttestationData, FetchError> {
        let lookup = self
            .await_att_data
            .as_ref()
            .expect("attestation lookup registered before fetch");
        lookup(slot, committee_index).await.map_err(FetchError::Await)
    }
}

/// Logs a warning when the fee recipient is not correctly populated in the
/// proposal. Not available before the bellatrix fork.
fn verify_fee_recipient(proposal: &Proposal, expected: ExecutionAddress) {
    if proposal.version < ForkVersion::Bellatrix {
        return;
    }
    let actual = proposal.block.body.fee_recipient;
    if actual != expected {
        warn!(
            expected = %expected,
            actual = %actual,
            slot = proposal.block.slot,
            "Proposal with unexpected fee recipient address"
        );
    }
}

struct PubkeysTracker {
    title: &'static str,
    not_selected: Vec<String>,
    resolved: Vec<String>,
}

impl PubkeysTracker {
    fn new(title: &'static str) -> Self {
        PubkeysTracker {
            title,
            not_selected: Vec::new(),
            resolved: Vec::new(),
        }
    }

    fn not_selected(&mut self, pubkey: &PubKey) {
        self.not_selected.push(pubkey.short());
    }

    fn resolved(&mut self, pubkey: &PubKey) {
        self.resolved.push(pubkey.short());
    }

    fn log(&self) {
        if !self.not_selected.is_empty() {
            debug!(
                pubkeys = self.not_selected.join(","),
                "{}: not selected pubkeys", self.title
            );
        }
        if !self.resolved.is_empty() {
            info!(
                pubkeys = self.resolved.join(","),
                "{}: resolved pubkeys", self.title
            );
        }
    }
}
