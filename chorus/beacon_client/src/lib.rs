//! Beacon-node REST consumer.
//!
//! [`BeaconApi`] is the seam every pipeline stage talks through; the
//! [`HttpBeaconClient`] implements it over the standard beacon REST API.
//! Tests substitute in-memory implementations.

pub mod mock;
pub mod valcache;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_hash::Hash256;

use dv_types::eth::{
    AttestationData, AttesterDuty, BeaconBlock, ForkVersion, ProposerDuty,
    SignedAggregateAndProof, SignedContributionAndProof, SignedValidatorRegistration,
    SignedVoluntaryExit, SyncCommitteeContribution, SyncCommitteeDuty, SyncCommitteeMessage,
    Validator, VersionedAttestation,
};
use dv_types::signed::SignedProposal;
use dv_types::{Proposal, PubKey, Signature};

pub use valcache::{ActiveValidators, CompleteValidators, ValidatorCache};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("beacon request failed: {0}")]
    Http(String),
    #[error("beacon node returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed decoding beacon response: {0}")]
    Decode(String),
}

impl BeaconError {
    /// 5xx and transport failures are retried within the duty deadline.
    pub fn is_transient(&self) -> bool {
        match self {
            BeaconError::Http(_) => true,
            BeaconError::Api { status, .. } => *status >= 500,
            BeaconError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for BeaconError {
    fn from(err: reqwest::Error) -> Self {
        BeaconError::Http(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    #[serde(with = "dv_types::eth::serde_helpers::root_hex")]
    pub genesis_validators_root: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(with = "serde_utils::quoted_u64")]
    pub head_slot: u64,
    pub is_syncing: bool,
}

/// Returns the slot containing `timestamp`, given the chain's genesis time.
/// Timestamps before genesis map to slot zero.
pub fn slot_from_timestamp(genesis_time: u64, slot_duration: Duration, timestamp: u64) -> u64 {
    timestamp.saturating_sub(genesis_time) / slot_duration.as_secs().max(1)
}

/// The beacon-node operations the pipeline consumes.
#[async_trait]
pub trait BeaconApi: Send + Sync {
    async fn genesis(&self) -> Result<Genesis, BeaconError>;

    async fn node_version(&self) -> Result<String, BeaconError>;

    async fn node_syncing(&self) -> Result<SyncStatus, BeaconError>;

    /// Fetches validator state restricted to the given pubkeys.
    /// `state_id` is `head` or a slot number.
    async fn validators(
        &self,
        state_id: &str,
        pubkeys: &[PubKey],
    ) -> Result<Vec<Validator>, BeaconError>;

    async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, BeaconError>;

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, BeaconError>;

    async fn sync_committee_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<SyncCommitteeDuty>, BeaconError>;

    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError>;

    async fn produce_proposal(
        &self,
        slot: u64,
        randao_reveal: Signature,
        graffiti: Option<Hash256>,
        builder_boost_factor: u64,
    ) -> Result<Proposal, BeaconError>;

    /// Returns `None` when the beacon node does not know the root, which the
    /// caller treats as retryable on the next slot.
    async fn aggregate_attestation(
        &self,
        slot: u64,
        att_data_root: Hash256,
        committee_index: u64,
    ) -> Result<Option<VersionedAttestation>, BeaconError>;

    /// Returns `None` when the beacon node does not know the block root for
    /// the subcommittee; retryable like aggregate attestations.
    async fn sync_committee_contribution(
        &self,
        slot: u64,
        subcommittee_index: u64,
        beacon_block_root: Hash256,
    ) -> Result<Option<SyncCommitteeContribution>, BeaconError>;

    async fn submit_attestations(
        &self,
        attestations: &[VersionedAttestation],
    ) -> Result<(), BeaconError>;

    async fn submit_proposal(&self, proposal: &SignedProposal) -> Result<(), BeaconError>;

    async fn submit_aggregates(
        &self,
        aggregates: &[SignedAggregateAndProof],
    ) -> Result<(), BeaconError>;

    async fn submit_sync_messages(
        &self,
        messages: &[SyncCommitteeMessage],
    ) -> Result<(), BeaconError>;

    async fn submit_contributions(
        &self,
        contributions: &[SignedContributionAndProof],
    ) -> Result<(), BeaconError>;

    async fn submit_voluntary_exit(&self, exit: &SignedVoluntaryExit) -> Result<(), BeaconError>;

    async fn register_validators(
        &self,
        registrations: &[SignedValidatorRegistration],
    ) -> Result<(), BeaconError>;
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct ProposalResponse {
    version: ForkVersion,
    #[serde(default)]
    execution_payload_blinded: bool,
    #[serde(default, with = "dv_types::eth::serde_helpers::quoted_u128")]
    execution_payload_value: u128,
    #[serde(default, with = "dv_types::eth::serde_helpers::quoted_u128")]
    consensus_block_value: u128,
    data: BeaconBlock,
}

#[derive(Deserialize)]
struct VersionedData<T> {
    version: ForkVersion,
    data: T,
}

#[derive(Serialize)]
struct ValidatorsRequest {
    ids: Vec<String>,
}

/// HTTP implementation of [`BeaconApi`].
pub struct HttpBeaconClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBeaconClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BeaconError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(HttpBeaconClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BeaconError> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BeaconError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    async fn post_no_content<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        consensus_version: Option<ForkVersion>,
    ) -> Result<(), BeaconError> {
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(version) = consensus_version {
            request = request.header("Eth-Consensus-Version", version.as_str());
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::status_error(response).await)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BeaconError> {
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| BeaconError::Decode(e.to_string()))
    }

    async fn status_error(response: reqwest::Response) -> BeaconError {
        let status = response.status().as_u16();
        let message = match response.bytes().await {
            Ok(bytes) => serde_json::from_slice::<ApiError>(&bytes)
                .map(|err| err.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).to_string()),
            Err(err) => err.to_string(),
        };
        BeaconError::Api { status, message }
    }

    /// Root-indexed lookups return `None` on 404 instead of an error.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, BeaconError> {
        let response = self.http.get(self.url(path)).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }
}

#[async_trait]
impl BeaconApi for HttpBeaconClient {
    async fn genesis(&self) -> Result<Genesis, BeaconError> {
        let response: ApiResponse<Genesis> = self.get_json("/eth/v1/beacon/genesis").await?;
        Ok(response.data)
    }

    async fn node_version(&self) -> Result<String, BeaconError> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }
        let response: ApiResponse<Version> = self.get_json("/eth/v1/node/version").await?;
        Ok(response.data.version)
    }

    async fn node_syncing(&self) -> Result<SyncStatus, BeaconError> {
        let response: ApiResponse<SyncStatus> = self.get_json("/eth/v1/node/syncing").await?;
        Ok(response.data)
    }

    async fn validators(
        &self,
        state_id: &str,
        pubkeys: &[PubKey],
    ) -> Result<Vec<Validator>, BeaconError> {
        let request = ValidatorsRequest {
            ids: pubkeys.iter().map(|pk| pk.to_string()).collect(),
        };
        let response: ApiResponse<Vec<Validator>> = self
            .post_json(
                &format!("/eth/v1/beacon/states/{state_id}/validators"),
                &request,
            )
            .await?;
        Ok(response.data)
    }

    async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, BeaconError> {
        let body: Vec<String> = indices.iter().map(|idx| idx.to_string()).collect();
        let response: ApiResponse<Vec<AttesterDuty>> = self
            .post_json(&format!("/eth/v1/validator/duties/attester/{epoch}"), &body)
            .await?;
        Ok(response.data)
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, BeaconError> {
        let response: ApiResponse<Vec<ProposerDuty>> = self
            .get_json(&format!("/eth/v1/validator/duties/proposer/{epoch}"))
            .await?;
        Ok(response.data)
    }

    async fn sync_committee_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<SyncCommitteeDuty>, BeaconError> {
        let body: Vec<String> = indices.iter().map(|idx| idx.to_string()).collect();
        let response: ApiResponse<Vec<SyncCommitteeDuty>> = self
            .post_json(&format!("/eth/v1/validator/duties/sync/{epoch}"), &body)
            .await?;
        Ok(response.data)
    }

    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError> {
        let response: ApiResponse<AttestationData> = self
            .get_json(&format!(
                "/eth/v1/validator/attestation_data?slot={slot}&committee_index={committee_index}"
            ))
            .await?;
        Ok(response.data)
    }

    async fn produce_proposal(
        &self,
        slot: u64,
        randao_reveal: Signature,
        graffiti: Option<Hash256>,
        builder_boost_factor: u64,
    ) -> Result<Proposal, BeaconError> {
        let mut path = format!(
            "/eth/v3/validator/blocks/{slot}?randao_reveal={randao_reveal}&builder_boost_factor={builder_boost_factor}"
        );
        if let Some(graffiti) = graffiti {
            path.push_str(&format!("&graffiti=0x{}", hex::encode(graffiti.as_slice())));
        }
        let response: ProposalResponse = self.get_json(&path).await?;
        debug!(slot, version = %response.version, blinded = response.execution_payload_blinded, "Produced proposal");
        Ok(Proposal {
            version: response.version,
            blinded: response.execution_payload_blinded,
            block: response.data,
            execution_payload_value: response.execution_payload_value,
            consensus_block_value: response.consensus_block_value,
        })
    }

    async fn aggregate_attestation(
        &self,
        slot: u64,
        att_data_root: Hash256,
        committee_index: u64,
    ) -> Result<Option<VersionedAttestation>, BeaconError> {
        let path = format!(
            "/eth/v2/validator/aggregate_attestation?attestation_data_root=0x{}&slot={slot}&committee_index={committee_index}",
            hex::encode(att_data_root.as_slice())
        );
        let response: Option<VersionedData<dv_types::eth::Attestation>> =
            self.get_optional(&path).await?;
        Ok(response.map(|versioned| VersionedAttestation {
            version: versioned.version,
            validator_index: None,
            attestation: versioned.data,
        }))
    }

    async fn sync_committee_contribution(
        &self,
        slot: u64,
        subcommittee_index: u64,
        beacon_block_root: Hash256,
    ) -> Result<Option<SyncCommitteeContribution>, BeaconError> {
        let path = format!(
            "/eth/v1/validator/sync_committee_contribution?slot={slot}&subcommittee_index={subcommittee_index}&beacon_block_root=0x{}",
            hex::encode(beacon_block_root.as_slice())
        );
        let response: Option<ApiResponse<SyncCommitteeContribution>> =
            self.get_optional(&path).await?;
        Ok(response.map(|r| r.data))
    }

    async fn submit_attestations(
        &self,
        attestations: &[VersionedAttestation],
    ) -> Result<(), BeaconError> {
        let version = attestations
            .first()
            .map(|att| att.version)
            .unwrap_or(ForkVersion::Electra);
        let body: Vec<&dv_types::eth::Attestation> =
            attestations.iter().map(|att| &att.attestation).collect();
        self.post_no_content("/eth/v2/beacon/pool/attestations", &body, Some(version))
            .await
    }

    async fn submit_proposal(&self, proposal: &SignedProposal) -> Result<(), BeaconError> {
        let path = if proposal.blinded {
            "/eth/v2/beacon/blinded_blocks"
        } else {
            "/eth/v2/beacon/blocks"
        };
        #[derive(Serialize)]
        struct SignedBlock<'a> {
            message: &'a BeaconBlock,
            signature: Signature,
        }
        self.post_no_content(
            path,
            &SignedBlock {
                message: &proposal.message,
                signature: proposal.signature,
            },
            Some(proposal.version),
        )
        .await
    }

    async fn submit_aggregates(
        &self,
        aggregates: &[SignedAggregateAndProof],
    ) -> Result<(), BeaconError> {
        let version = aggregates
            .first()
            .map(|agg| agg.version)
            .unwrap_or(ForkVersion::Electra);
        self.post_no_content("/eth/v2/validator/aggregate_and_proofs", &aggregates, Some(version))
            .await
    }

    async fn submit_sync_messages(
        &self,
        messages: &[SyncCommitteeMessage],
    ) -> Result<(), BeaconError> {
        self.post_no_content("/eth/v1/beacon/pool/sync_committees", &messages, None)
            .await
    }

    async fn submit_contributions(
        &self,
        contributions: &[SignedContributionAndProof],
    ) -> Result<(), BeaconError> {
        self.post_no_content("/eth/v1/validator/contribution_and_proofs", &contributions, None)
            .await
    }

    async fn submit_voluntary_exit(&self, exit: &SignedVoluntaryExit) -> Result<(), BeaconError> {
        self.post_no_content("/eth/v1/beacon/pool/voluntary_exits", exit, None)
            .await
    }

    async fn register_validators(
        &self,
        registrations: &[SignedValidatorRegistration],
    ) -> Result<(), BeaconError> {
        self.post_no_content("/eth/v1/validator/register_validator", &registrations, None)
            .await
    }
}
