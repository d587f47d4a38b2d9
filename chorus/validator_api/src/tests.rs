use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tree_hash::TreeHash;

use beacon_client::mock::MockBeacon;
use beacon_client::ValidatorCache;
use dv_types::eth::{AttesterDuty, ExecutionAddress, ProposerDuty};
use dv_types::signing::ForkInfo;
use dv_types::{
    Duty, DutyDefinition, DutyDefinitionSet, DutyKind, ParSignedDataSet, Proposal, PubKey, Root,
    Signature, SignedData,
};

use crate::component::{ClusterValidator, Component};
use crate::router::{router, ApiState};

fn group_pubkey() -> PubKey {
    PubKey([0xaa; 48])
}

fn pubshare(idx: u8) -> PubKey {
    PubKey([idx; 48])
}

struct Harness {
    state: ApiState,
    published: Arc<Mutex<Vec<(Duty, ParSignedDataSet)>>>,
    shutdown: CancellationToken,
}

fn stored_proposal(slot: u64) -> Proposal {
    MockBeacon::proposal(slot, Signature([0x11; 96]))
}

fn attester_def_set(slot: u64) -> DutyDefinitionSet {
    let mut set = DutyDefinitionSet::new();
    set.insert(
        group_pubkey(),
        DutyDefinition::Attester(AttesterDuty {
            pubkey: group_pubkey(),
            slot,
            validator_index: 7,
            committee_index: 0,
            committee_length: 128,
            committees_at_slot: 2,
            validator_committee_index: 3,
        }),
    );
    set
}

fn harness(upstream: Option<String>) -> Harness {
    let beacon = Arc::new(MockBeacon::default().with_validator(7, group_pubkey()));
    let val_cache = Arc::new(ValidatorCache::new(beacon.clone(), vec![group_pubkey()]));

    let validators = vec![ClusterValidator {
        group_pubkey: group_pubkey(),
        pubshares: vec![pubshare(1), pubshare(2), pubshare(3), pubshare(4)],
    }];

    let mut component = Component::new(
        beacon,
        val_cache,
        &validators,
        1,
        Box::new(|_| ExecutionAddress::zero()),
        false,
        30_000_000,
        ForkInfo::single([0, 0, 0, 0], Root::repeat_byte(0x42)),
        0,
        Duration::from_secs(12),
        true, // insecure test mode: no share keys behind the pubshares
    );

    component.register_await_att_data(Box::new(|slot, committee_index| {
        Box::pin(async move { Ok(MockBeacon::att_data(slot, committee_index)) })
    }));
    component.register_await_proposal(Box::new(|slot| {
        Box::pin(async move { Ok(stored_proposal(slot)) })
    }));
    component.register_duty_definition(Box::new(|duty| {
        Box::pin(async move {
            match duty.kind {
                DutyKind::Proposer => {
                    let mut set = DutyDefinitionSet::new();
                    set.insert(
                        group_pubkey(),
                        DutyDefinition::Proposer(ProposerDuty {
                            pubkey: group_pubkey(),
                            slot: duty.slot,
                            validator_index: 7,
                        }),
                    );
                    Ok(set)
                }
                _ => Ok(attester_def_set(duty.slot)),
            }
        })
    }));
    component.register_pubkey_by_attestation(Box::new(|_, _, validator_index| {
        Box::pin(async move {
            if validator_index == 7 {
                Ok(group_pubkey())
            } else {
                Err("unknown validator".into())
            }
        })
    }));

    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = published.clone();
    component.subscribe(Box::new(move |duty, set| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().push((duty, set));
            Ok(())
        })
    }));

    let shutdown = CancellationToken::new();
    let state = ApiState {
        component: Arc::new(component),
        upstream: upstream.unwrap_or_else(|| "http://127.0.0.1:1".to_string()),
        http: reqwest::Client::new(),
        shutdown: shutdown.clone(),
    };

    Harness {
        state,
        published,
        shutdown,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn invalid_randao_length_yields_structured_400() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::get("/eth/v3/validator/blocks/123?randao_reveal=0x0000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let json = body_json(response).await;
    assert_eq!(json["code"], 400);
    assert_eq!(
        json["message"],
        "invalid length for 0x-hex query parameter randao_reveal, expect 96 bytes"
    );
}

#[tokio::test]
async fn missing_randao_yields_structured_400() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::get("/eth/v3/validator/blocks/123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let json = body_json(response).await;
    assert_eq!(json["message"], "missing 0x-hex query parameter randao_reveal");
}

#[tokio::test]
async fn invalid_uint_path_parameter() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::get("/eth/v1/validator/duties/proposer/not_a_number")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(
        json["message"],
        "invalid uint path parameter epoch [not_a_number]"
    );
}

#[tokio::test]
async fn body_parse_errors() {
    let harness = harness(None);
    let app = router(harness.state);

    let response = app
        .clone()
        .oneshot(
            Request::post("/eth/v1/validator/duties/attester/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["message"], "empty request body");

    let response = app
        .oneshot(
            Request::post("/eth/v1/validator/duties/attester/1")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await["message"],
        "failed parsing json request body"
    );
}

#[tokio::test]
async fn wrong_method_yields_404() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v1/validator/attestation_data")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn attestation_data_blocks_and_returns_agreed_value() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::get("/eth/v1/validator/attestation_data?slot=32&committee_index=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["slot"], "32");
    assert_eq!(json["data"]["index"], "0");
}

#[tokio::test]
async fn produce_block_v3_injects_randao_and_serves_agreed_block() {
    let harness = harness(None);
    let published = harness.published.clone();
    let randao = format!("0x{}", "22".repeat(96));

    let response = router(harness.state)
        .oneshot(
            Request::get(format!(
                "/eth/v3/validator/blocks/123?randao_reveal={randao}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Eth-Consensus-Version").unwrap(),
        "deneb"
    );
    assert_eq!(
        response
            .headers()
            .get("Eth-Execution-Payload-Blinded")
            .unwrap(),
        "false"
    );
    let json = body_json(response).await;
    assert_eq!(json["data"]["slot"], "123");

    // The randao reveal was injected as a partial signature.
    let published = published.lock();
    assert_eq!(published.len(), 1);
    let (duty, set) = &published[0];
    assert_eq!(*duty, Duty::randao(123));
    let parsig = set.get(&group_pubkey()).unwrap();
    assert_eq!(parsig.share_idx, 1);
    assert!(matches!(parsig.data, SignedData::Randao(_)));
}

#[tokio::test]
async fn submit_block_round_trips_matching_proposal() {
    let harness = harness(None);
    let published = harness.published.clone();

    let stored = stored_proposal(64);
    let body = serde_json::json!({
        "message": serde_json::to_value(&stored.block).unwrap(),
        "signature": Signature([0x33; 96]),
    });

    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v2/beacon/blocks")
                .header("Eth-Consensus-Version", "deneb")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let published = published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, Duty::proposer(64));
}

#[tokio::test]
async fn submit_block_rejects_mismatching_proposal() {
    let harness = harness(None);

    let mut block = stored_proposal(64).block;
    block.state_root = Root::repeat_byte(0xdd);
    let body = serde_json::json!({
        "message": serde_json::to_value(&block).unwrap(),
        "signature": Signature([0x33; 96]),
    });

    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v2/beacon/blocks")
                .header("Eth-Consensus-Version", "deneb")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["message"], "proposal data does not match duty");
}

#[tokio::test]
async fn submit_attestation_resolves_validator_from_aggregation_bits() {
    let harness = harness(None);
    let published = harness.published.clone();

    let data = MockBeacon::att_data(32, 0);
    let body = serde_json::json!([{
        // Single bit at the duty's validator committee index (3).
        "aggregation_bits": "0x08",
        "data": serde_json::to_value(data).unwrap(),
        "signature": Signature([0x44; 96]),
    }]);

    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v2/beacon/pool/attestations")
                .header("Eth-Consensus-Version", "deneb")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let published = published.lock();
    assert_eq!(published.len(), 1);
    let (duty, set) = &published[0];
    assert_eq!(*duty, Duty::attester(32));
    let parsig = set.get(&group_pubkey()).unwrap();
    let SignedData::Attestation(att) = &parsig.data else {
        panic!("expected attestation");
    };
    assert_eq!(att.validator_index, Some(7));
    assert_eq!(att.data().tree_hash_root(), data.tree_hash_root());
}

#[tokio::test]
async fn submit_attestation_rejects_multiple_aggregation_bits() {
    let harness = harness(None);
    let body = serde_json::json!([{
        "aggregation_bits": "0x0c",
        "data": serde_json::to_value(MockBeacon::att_data(32, 0)).unwrap(),
        "signature": Signature([0x44; 96]),
    }]);

    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v2/beacon/pool/attestations")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["message"]
        .as_str()
        .unwrap()
        .starts_with("unexpected number of aggregation bits"));
}

#[tokio::test]
async fn attester_duties_serve_pubshares() {
    let harness = harness(None);
    // Upstream duties come from the mock beacon node.
    let beacon = Arc::new(MockBeacon::default().with_validator(7, group_pubkey()));
    beacon.attester_duties.lock().push(AttesterDuty {
        pubkey: group_pubkey(),
        slot: 33,
        validator_index: 7,
        committee_index: 0,
        committee_length: 128,
        committees_at_slot: 2,
        validator_committee_index: 3,
    });
    // Rebuild the harness component around this beacon mock.
    let mut state = harness.state;
    let val_cache = Arc::new(ValidatorCache::new(beacon.clone(), vec![group_pubkey()]));
    let component = Component::new(
        beacon,
        val_cache,
        &[ClusterValidator {
            group_pubkey: group_pubkey(),
            pubshares: vec![pubshare(1), pubshare(2), pubshare(3), pubshare(4)],
        }],
        1,
        Box::new(|_| ExecutionAddress::zero()),
        false,
        30_000_000,
        ForkInfo::single([0, 0, 0, 0], Root::repeat_byte(0x42)),
        0,
        Duration::from_secs(12),
        true,
    );
    state.component = Arc::new(component);

    let response = router(state)
        .oneshot(
            Request::post("/eth/v1/validator/duties/attester/1")
                .body(Body::from(r#"["7"]"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    // The group pubkey is replaced by this operator's pubshare.
    assert_eq!(
        json["data"][0]["pubkey"],
        pubshare(1).to_string()
    );
}

#[tokio::test]
async fn proposer_config_pins_registration_overrides() {
    let harness = harness(None);
    let response = router(harness.state)
        .oneshot(
            Request::get("/proposer_config")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let json = body_json(response).await;
    let entry = &json["proposer_config"][pubshare(1).to_string()];
    // Timestamp pinned to genesis plus one slot.
    assert_eq!(entry["builder"]["registration_overrides"]["timestamp"], "12");
    assert_eq!(
        entry["builder"]["registration_overrides"]["public_key"],
        group_pubkey().to_string()
    );
    assert_eq!(json["default_config"]["builder"]["enabled"], false);
}

#[tokio::test]
async fn unknown_registration_is_swallowed() {
    let harness = harness(None);
    let published = harness.published.clone();

    let body = serde_json::json!([{
        "message": {
            "fee_recipient": "0x000000000000000000000000000000000000dead",
            "gas_limit": "30000000",
            "timestamp": "1700000000",
            "pubkey": PubKey([0x77; 48]),
        },
        "signature": Signature([0x55; 96]),
    }]);

    let response = router(harness.state)
        .oneshot(
            Request::post("/eth/v1/validator/register_validator")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(published.lock().is_empty());
}

#[tokio::test]
async fn proxy_passthrough_and_shutdown() {
    // A tiny upstream answering the node-version endpoint.
    let upstream_app = axum::Router::new().route(
        "/eth/v1/node/version",
        axum::routing::get(|| async {
            (
                [("content-type", "application/json")],
                r#"{"data":{"version":"mock/v0"}}"#,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream_app).await.unwrap();
    });

    let harness = harness(Some(format!("http://{addr}")));
    let app = router(harness.state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::get("/eth/v1/node/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let json = body_json(response).await;
    assert_eq!(json["data"]["version"], "mock/v0");

    // Cancelling the root context returns cleanly.
    harness.shutdown.cancel();
    let response = app
        .oneshot(
            Request::get("/eth/v1/node/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn selections_round_trip_through_aggregate_store() {
    let harness = harness(None);
    // await_agg_sig echoes an aggregated selection.
    let mut state = harness.state;
    let component = Arc::get_mut(&mut state.component).unwrap();
    component.register_await_agg_sig(Box::new(|duty, _| {
        Box::pin(async move {
            Ok(SignedData::BeaconCommitteeSelection(
                dv_types::eth::BeaconCommitteeSelection {
                    validator_index: 7,
                    slot: duty.slot,
                    selection_proof: Signature([0x66; 96]),
                },
            ))
        })
    }));

    let body = serde_json::json!([{
        "validator_index": "7",
        "slot": "32",
        "selection_proof": Signature([0x11; 96]),
    }]);

    let response = router(state)
        .oneshot(
            Request::post("/eth/v1/validator/beacon_committee_selections")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["data"][0]["selection_proof"],
        Signature([0x66; 96]).to_string()
    );

    // The partial selection was injected into the pipeline.
    let published = harness.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, Duty::prepare_aggregator(32));
}
