//! VC-facing HTTP surface.
//!
//! Routes the standard beacon-node endpoints onto the [`Component`] and
//! reverse-proxies everything else to the real beacon node. Path and query
//! parsing produce the structured 400 messages validator clients rely on;
//! wrong methods and unknown endpoints yield 404.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dv_types::eth::{
    AggregateAndProof, AttestationData, Bits, BeaconBlock, BeaconCommitteeSelection,
    ForkVersion, SignedContributionAndProof, SignedValidatorRegistration, SignedVoluntaryExit,
    SyncCommitteeMessage, SyncCommitteeSelection,
};
use dv_types::{Root, Signature};

use crate::component::Component;
use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub component: Arc<Component>,
    /// Base URL of the upstream beacon node for proxied requests.
    pub upstream: String,
    pub http: reqwest::Client,
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(component: Arc<Component>, upstream: String, shutdown: CancellationToken) -> Self {
        ApiState {
            component,
            upstream: upstream.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            shutdown,
        }
    }
}

/// Binds and serves the VC-facing API until shutdown.
pub async fn serve(state: ApiState, addr: std::net::SocketAddr) -> Result<(), String> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed binding validator api to {addr}: {e}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("validator api server failed: {e}"))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/eth/v1/validator/duties/attester/:epoch",
            post(attester_duties).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/duties/proposer/:epoch",
            get(proposer_duties).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/duties/sync/:epoch",
            post(sync_duties).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/attestation_data",
            get(attestation_data).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v3/validator/blocks/:slot",
            get(produce_block_v3).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/pool/attestations",
            post(submit_attestations).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v2/beacon/pool/attestations",
            post(submit_attestations).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/blocks",
            post(submit_block).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v2/beacon/blocks",
            post(submit_block).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/blinded_blocks",
            post(submit_blinded_block).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v2/beacon/blinded_blocks",
            post(submit_blinded_block).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/aggregate_attestation",
            get(aggregate_attestation).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v2/validator/aggregate_attestation",
            get(aggregate_attestation).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/aggregate_and_proofs",
            post(submit_aggregates).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v2/validator/aggregate_and_proofs",
            post(submit_aggregates).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/sync_committee_contribution",
            get(sync_committee_contribution).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/pool/sync_committees",
            post(submit_sync_messages).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/contribution_and_proofs",
            post(submit_contributions).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/pool/voluntary_exits",
            post(submit_voluntary_exit).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/register_validator",
            post(register_validator).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/beacon_committee_selections",
            post(beacon_committee_selections).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/validator/sync_committee_selections",
            post(sync_committee_selections).fallback(endpoint_not_found),
        )
        .route(
            "/eth/v1/beacon/states/:state_id/validators",
            get(get_validators)
                .post(post_validators)
                .fallback(endpoint_not_found),
        )
        .route(
            "/proposer_config",
            get(proposer_config).fallback(endpoint_not_found),
        )
        .fallback(proxy)
        .with_state(state)
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found()
}

// ---- parsing helpers ----

fn parse_uint_path(name: &str, raw: &str) -> Result<u64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::invalid_uint_path(name, raw))
}

fn query_map(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(raw) = raw else { return map };
    for pair in raw.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn hex_query(
    query: &HashMap<String, String>,
    name: &str,
    expect_bytes: usize,
) -> Result<Vec<u8>, ApiError> {
    let raw = query.get(name).ok_or_else(|| ApiError::missing_query(name))?;
    let stripped = raw
        .strip_prefix("0x")
        .ok_or_else(|| ApiError::invalid_hex_query(name, raw))?;
    let bytes =
        hex::decode(stripped).map_err(|_| ApiError::invalid_hex_query(name, raw))?;
    if bytes.len() != expect_bytes {
        return Err(ApiError::invalid_hex_length(name, expect_bytes));
    }
    Ok(bytes)
}

fn uint_query(query: &HashMap<String, String>, name: &str) -> Result<u64, ApiError> {
    let raw = query
        .get(name)
        .ok_or_else(|| ApiError::missing_uint_query(name))?;
    raw.parse()
        .map_err(|_| ApiError::invalid_uint_query(name, raw))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::empty_body());
    }
    serde_json::from_slice(body).map_err(|err| {
        debug!(%err, "Request body failed to parse");
        ApiError::invalid_body()
    })
}

fn consensus_version(headers: &HeaderMap) -> ForkVersion {
    headers
        .get("Eth-Consensus-Version")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(ForkVersion::Deneb)
}

#[derive(Serialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Serialize)]
struct DutiesResponse<T> {
    dependent_root: String,
    execution_optimistic: bool,
    data: T,
}

fn duties_response<T: Serialize>(data: T) -> Json<DutiesResponse<T>> {
    Json(DutiesResponse {
        dependent_root: format!("0x{}", hex::encode([0u8; 32])),
        execution_optimistic: false,
        data,
    })
}

// ---- duty endpoints ----

async fn attester_duties(
    State(state): State<ApiState>,
    Path(epoch): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let epoch = parse_uint_path("epoch", &epoch)?;
    let raw_indices: Vec<String> = parse_body(&body)?;
    let indices = parse_indices(raw_indices)?;
    let duties = state.component.attester_duties(epoch, &indices).await?;
    Ok(duties_response(duties).into_response())
}

async fn proposer_duties(
    State(state): State<ApiState>,
    Path(epoch): Path<String>,
) -> Result<Response, ApiError> {
    let epoch = parse_uint_path("epoch", &epoch)?;
    let duties = state.component.proposer_duties(epoch).await?;
    Ok(duties_response(duties).into_response())
}

async fn sync_duties(
    State(state): State<ApiState>,
    Path(epoch): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let epoch = parse_uint_path("epoch", &epoch)?;
    let raw_indices: Vec<String> = parse_body(&body)?;
    let indices = parse_indices(raw_indices)?;
    let duties = state
        .component
        .sync_committee_duties(epoch, &indices)
        .await?;
    Ok(duties_response(duties).into_response())
}

fn parse_indices(raw: Vec<String>) -> Result<Vec<u64>, ApiError> {
    raw.iter()
        .map(|value| {
            value
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid validator index [{value}]")))
        })
        .collect()
}

// ---- data-producing endpoints ----

async fn attestation_data(
    State(state): State<ApiState>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = query_map(raw);
    let slot = uint_query(&query, "slot")?;
    let committee_index = uint_query(&query, "committee_index")?;
    let data = state.component.attestation_data(slot, committee_index).await?;
    Ok(Json(DataResponse { data }).into_response())
}

async fn produce_block_v3(
    State(state): State<ApiState>,
    Path(slot): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let slot = parse_uint_path("slot", &slot)?;
    let query = query_map(raw);
    let randao_bytes = hex_query(&query, "randao_reveal", 96)?;
    let randao_reveal =
        Signature::from_bytes(&randao_bytes).map_err(ApiError::bad_request)?;

    let proposal = state.component.produce_proposal(slot, randao_reveal).await?;

    #[derive(Serialize)]
    struct ProduceBlockResponse {
        version: ForkVersion,
        execution_payload_blinded: bool,
        #[serde(with = "dv_types::eth::serde_helpers::quoted_u128")]
        execution_payload_value: u128,
        #[serde(with = "dv_types::eth::serde_helpers::quoted_u128")]
        consensus_block_value: u128,
        data: BeaconBlock,
    }

    let response = Json(ProduceBlockResponse {
        version: proposal.version,
        execution_payload_blinded: proposal.blinded,
        execution_payload_value: proposal.execution_payload_value,
        consensus_block_value: proposal.consensus_block_value,
        data: proposal.block,
    });

    Ok((
        [
            ("Eth-Consensus-Version", proposal.version.as_str().to_string()),
            (
                "Eth-Execution-Payload-Blinded",
                proposal.blinded.to_string(),
            ),
            (
                "Eth-Execution-Payload-Value",
                proposal.execution_payload_value.to_string(),
            ),
            (
                "Eth-Consensus-Block-Value",
                proposal.consensus_block_value.to_string(),
            ),
        ],
        response,
    )
        .into_response())
}

// ---- submission endpoints ----

#[derive(Deserialize)]
struct SignedBlockBody {
    message: BeaconBlock,
    signature: Signature,
}

async fn submit_block(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let block: SignedBlockBody = parse_body(&body)?;
    state
        .component
        .submit_proposal(false, consensus_version(&headers), block.message, block.signature)
        .await?;
    Ok(StatusCode::OK)
}

async fn submit_blinded_block(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let block: SignedBlockBody = parse_body(&body)?;
    state
        .component
        .submit_proposal(true, consensus_version(&headers), block.message, block.signature)
        .await?;
    Ok(StatusCode::OK)
}

/// Accepts both pre-electra attestations (aggregation bits) and electra
/// single attestations (explicit attester index).
#[derive(Deserialize)]
struct SubmittedAttestation {
    #[serde(default)]
    aggregation_bits: Bits,
    data: AttestationData,
    signature: Signature,
    #[serde(default)]
    committee_bits: Option<Bits>,
    #[serde(default, with = "dv_types::eth::serde_helpers::quoted_u64_opt")]
    committee_index: Option<u64>,
    #[serde(default, with = "dv_types::eth::serde_helpers::quoted_u64_opt")]
    attester_index: Option<u64>,
}

async fn submit_attestations(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let submitted: Vec<SubmittedAttestation> = parse_body(&body)?;
    let version = consensus_version(&headers);

    let attestations = submitted
        .into_iter()
        .map(|att| {
            let mut data = att.data;
            if let Some(committee_index) = att.committee_index {
                data.index = committee_index;
            }
            (
                dv_types::eth::Attestation {
                    aggregation_bits: att.aggregation_bits,
                    data,
                    signature: att.signature,
                    committee_bits: att.committee_bits,
                },
                att.attester_index,
            )
        })
        .collect();

    state
        .component
        .submit_attestations(attestations, version)
        .await?;
    Ok(StatusCode::OK)
}

async fn aggregate_attestation(
    State(state): State<ApiState>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = query_map(raw);
    let slot = uint_query(&query, "slot")?;
    let root_bytes = hex_query(&query, "attestation_data_root", 32)?;
    let root = Root::from_slice(&root_bytes);

    let aggregate = state.component.aggregate_attestation(slot, root).await?;

    #[derive(Serialize)]
    struct AggregateResponse {
        version: ForkVersion,
        data: dv_types::eth::Attestation,
    }
    Ok(Json(AggregateResponse {
        version: aggregate.version,
        data: aggregate.attestation,
    })
    .into_response())
}

#[derive(Deserialize)]
struct SignedAggregateBody {
    message: AggregateAndProof,
    signature: Signature,
}

async fn submit_aggregates(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let submitted: Vec<SignedAggregateBody> = parse_body(&body)?;
    let version = consensus_version(&headers);
    state
        .component
        .submit_aggregates(
            version,
            submitted
                .into_iter()
                .map(|agg| (agg.message, agg.signature))
                .collect(),
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn sync_committee_contribution(
    State(state): State<ApiState>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = query_map(raw);
    let slot = uint_query(&query, "slot")?;
    let subcommittee_index = uint_query(&query, "subcommittee_index")?;
    let root_bytes = hex_query(&query, "beacon_block_root", 32)?;
    let root = Root::from_slice(&root_bytes);

    let data = state
        .component
        .sync_committee_contribution(slot, subcommittee_index, root)
        .await?;
    Ok(Json(DataResponse { data }).into_response())
}

async fn submit_sync_messages(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let messages: Vec<SyncCommitteeMessage> = parse_body(&body)?;
    state.component.submit_sync_messages(messages).await?;
    Ok(StatusCode::OK)
}

async fn submit_contributions(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let contributions: Vec<SignedContributionAndProof> = parse_body(&body)?;
    state.component.submit_contributions(contributions).await?;
    Ok(StatusCode::OK)
}

async fn submit_voluntary_exit(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let exit: SignedVoluntaryExit = parse_body(&body)?;
    state.component.submit_voluntary_exit(exit).await?;
    Ok(StatusCode::OK)
}

async fn register_validator(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let registrations: Vec<SignedValidatorRegistration> = parse_body(&body)?;
    state.component.register_validators(registrations).await?;
    Ok(StatusCode::OK)
}

async fn beacon_committee_selections(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let selections: Vec<BeaconCommitteeSelection> = parse_body(&body)?;
    let data = state
        .component
        .aggregate_beacon_committee_selections(selections)
        .await?;
    Ok(Json(DataResponse { data }).into_response())
}

async fn sync_committee_selections(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let selections: Vec<SyncCommitteeSelection> = parse_body(&body)?;
    let data = state
        .component
        .aggregate_sync_committee_selections(selections)
        .await?;
    Ok(Json(DataResponse { data }).into_response())
}

// ---- validator lookup ----

async fn get_validators(
    State(state): State<ApiState>,
    Path(state_id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = query_map(raw);
    let ids: Vec<String> = query
        .get("id")
        .map(|ids| ids.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    validators_response(&state, &state_id, &ids).await
}

#[derive(Deserialize)]
struct ValidatorsBody {
    #[serde(default)]
    ids: Vec<String>,
}

async fn post_validators(
    State(state): State<ApiState>,
    Path(state_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ValidatorsBody = parse_body(&body)?;
    validators_response(&state, &state_id, &request.ids).await
}

async fn validators_response(
    state: &ApiState,
    state_id: &str,
    ids: &[String],
) -> Result<Response, ApiError> {
    let data = state.component.validators(state_id, ids).await?;
    #[derive(Serialize)]
    struct ValidatorsResponse {
        execution_optimistic: bool,
        data: Vec<dv_types::eth::Validator>,
    }
    Ok(Json(ValidatorsResponse {
        execution_optimistic: false,
        data,
    })
    .into_response())
}

async fn proposer_config(State(state): State<ApiState>) -> Response {
    Json(state.component.proposer_config()).into_response()
}

// ---- reverse proxy ----

/// Requests not handled by the component are transparently forwarded to the
/// beacon node. In-flight requests are cancelled on shutdown.
async fn proxy(State(state): State<ApiState>, request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let url = format!("{}{}", state.upstream, path_and_query);

    let method =
        reqwest::Method::from_bytes(request.method().as_str().as_bytes()).unwrap_or_default();

    let body = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::bad_request("failed reading request body").into_response(),
    };

    let upstream_request = state.http.request(method, &url).body(body.to_vec());

    let result = tokio::select! {
        result = upstream_request.send() => result,
        _ = state.shutdown.cancelled() => {
            debug!(url, "Proxy request cancelled by shutdown");
            return ApiError::new(StatusCode::BAD_GATEWAY, "proxy cancelled").into_response();
        }
    };

    match result {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .headers()
                .get(CONTENT_TYPE.as_str())
                .and_then(|value| value.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let bytes = tokio::select! {
                bytes = upstream.bytes() => bytes.unwrap_or_default(),
                _ = state.shutdown.cancelled() => {
                    return ApiError::new(StatusCode::BAD_GATEWAY, "proxy cancelled").into_response();
                }
            };
            Response::builder()
                .status(status)
                .header(CONTENT_TYPE, content_type)
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(err) => {
            warn!(%err, url, "Proxy request failed");
            ApiError::new(StatusCode::BAD_GATEWAY, "beacon node unavailable").into_response()
        }
    }
}
