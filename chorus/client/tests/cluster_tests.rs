//! End-to-end cluster scenarios: four operator nodes wired over an in-memory
//! peer bus against one shared beacon-node mock, with simulated validator
//! clients signing through real threshold BLS key shares.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tree_hash::TreeHash;

use beacon_client::mock::MockBeacon;
use beacon_client::BeaconApi;
use chorus_client::{wire, NodeConfig, Pipeline};
use chorus_slot_clock::ManualSlotClock;
use dv_types::eth::{
    Attestation, AttesterDuty, Bits, ForkVersion, ProposerDuty, SignedEpoch,
    VersionedAttestation,
};
use dv_types::signed::SignedProposal;
use dv_types::signing::{signing_root_for, ForkInfo};
use dv_types::{PubKey, Root, Signature, SignedData};
use par_sig_ex::MemoryBus;
use validator_api::ClusterValidator;

const CLUSTER_SIZE: u64 = 4;
const THRESHOLD: usize = 3;
const VALIDATOR_INDEX: u64 = 7;

struct TestCluster {
    nodes: Vec<Pipeline<ManualSlotClock>>,
    clock: ManualSlotClock,
    beacon: Arc<MockBeacon>,
    group_secret: tbls::SecretKey,
    group_pubkey: PubKey,
    shares: Vec<tbls::SecretKey>,
    fork_info: ForkInfo,
    _shutdown: CancellationToken,
}

impl TestCluster {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let group_secret = tbls::SecretKey::generate(&mut rng);
        let shares = tbls::split(&group_secret, CLUSTER_SIZE, THRESHOLD as u64, &mut rng)
            .expect("valid split");
        let group_pubkey = PubKey(group_secret.public_key().to_bytes());
        let pubshares: Vec<PubKey> = shares
            .iter()
            .map(|share| PubKey(share.public_key().to_bytes()))
            .collect();

        let beacon = Arc::new(MockBeacon::default().with_validator(VALIDATOR_INDEX, group_pubkey));
        let fork_info = ForkInfo::single([0, 0, 0, 0], Root::repeat_byte(0x47));
        let clock = ManualSlotClock::new(Duration::from_secs(0), Duration::from_secs(12));
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();

        let validators = vec![ClusterValidator {
            group_pubkey,
            pubshares,
        }];

        let nodes = (1..=CLUSTER_SIZE)
            .map(|share_idx| {
                let (transport, inbound) = bus.register();
                wire(
                    NodeConfig {
                        share_idx,
                        cluster_size: CLUSTER_SIZE,
                        threshold: THRESHOLD,
                        duty_expiry_slots: 2,
                        builder_enabled: false,
                        target_gas_limit: 30_000_000,
                        fee_recipient: Default::default(),
                        graffiti: None,
                        insecure_test: false,
                        genesis_time: 0,
                        slot_duration: Duration::from_secs(12),
                        fork_info: fork_info.clone(),
                        beacon_url: "http://127.0.0.1:1".to_string(),
                    },
                    beacon.clone() as Arc<dyn BeaconApi>,
                    clock.clone(),
                    validators.clone(),
                    transport,
                    inbound,
                    shutdown.clone(),
                )
            })
            .collect();

        TestCluster {
            nodes,
            clock,
            beacon,
            group_secret,
            group_pubkey,
            shares,
            fork_info,
            _shutdown: shutdown,
        }
    }

    async fn tick_all(&self, slot: u64) {
        self.clock.set_slot(slot);
        for node in &self.nodes {
            node.scheduler.tick(slot).await;
        }
        // Let the spawned duty tasks make progress.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Signs a payload with one operator's key share, as its validator
    /// client would.
    fn share_sign(&self, data: &SignedData, operator: usize) -> Signature {
        let root = signing_root_for(data, &self.fork_info);
        Signature(self.shares[operator].sign(root.as_slice()).to_bytes())
    }

    fn group_signature(&self, data: &SignedData) -> Signature {
        let root = signing_root_for(data, &self.fork_info);
        Signature(self.group_secret.sign(root.as_slice()).to_bytes())
    }

    fn attester_duty(&self, slot: u64) -> AttesterDuty {
        AttesterDuty {
            pubkey: self.group_pubkey,
            slot,
            validator_index: VALIDATOR_INDEX,
            committee_index: 0,
            committee_length: 4,
            committees_at_slot: 1,
            validator_committee_index: 0,
        }
    }

    /// Builds the partial attestation operator `operator` submits for `slot`,
    /// over the given attestation data.
    fn partial_attestation(
        &self,
        data: dv_types::eth::AttestationData,
        operator: usize,
    ) -> Attestation {
        let mut attestation = Attestation {
            aggregation_bits: Bits::single(4, 0),
            data,
            signature: Signature::default(),
            committee_bits: None,
        };
        let unsigned = SignedData::Attestation(VersionedAttestation {
            version: ForkVersion::Deneb,
            validator_index: Some(VALIDATOR_INDEX),
            attestation: attestation.clone(),
        });
        attestation.signature = self.share_sign(&unsigned, operator);
        attestation
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn attester_happy_path() {
    let cluster = TestCluster::new(1);
    cluster
        .beacon
        .attester_duties
        .lock()
        .push(cluster.attester_duty(32));

    cluster.tick_all(32).await;

    // Every operator's validator client fetches identical attestation data
    // and submits a partial attestation.
    let mut expected_data = None;
    for (operator, node) in cluster.nodes.iter().enumerate() {
        let data = node.component.attestation_data(32, 0).await.unwrap();
        if let Some(expected) = expected_data {
            assert_eq!(data, expected, "clients observed different data");
        }
        expected_data = Some(data);

        let attestation = cluster.partial_attestation(data, operator);
        node.component
            .submit_attestations(vec![(attestation, None)], ForkVersion::Deneb)
            .await
            .unwrap();
    }

    // Each node reaches the threshold and submits exactly one attestation.
    let beacon = cluster.beacon.clone();
    wait_until(move || beacon.submitted.lock().attestations.len() == CLUSTER_SIZE as usize).await;

    let submitted = cluster.beacon.submitted.lock();
    let first = &submitted.attestations[0];
    assert!(submitted.attestations.iter().all(|att| att == first));

    // The aggregate equals the unsplit key's signature over the same root.
    let expected = cluster.group_signature(&SignedData::Attestation(first.clone()));
    assert_eq!(first.attestation.signature, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn proposer_path_with_randao() {
    let cluster = TestCluster::new(2);
    cluster.beacon.proposer_duties.lock().push(ProposerDuty {
        pubkey: cluster.group_pubkey,
        slot: 64,
        validator_index: VALIDATOR_INDEX,
    });

    cluster.tick_all(64).await;

    // Each validator client submits its randao partial via block production;
    // the calls block until the cluster agrees on a proposal.
    let mut producers = Vec::new();
    for (operator, node) in cluster.nodes.iter().enumerate() {
        let randao = cluster.share_sign(
            &SignedData::Randao(SignedEpoch {
                epoch: 2,
                signature: Signature::default(),
            }),
            operator,
        );
        let component = node.component.clone();
        producers.push(tokio::spawn(async move {
            component.produce_proposal(64, randao).await
        }));
    }

    let mut proposals = Vec::new();
    for producer in producers {
        proposals.push(producer.await.unwrap().unwrap());
    }

    // All clients received the identical agreed block, carrying the
    // aggregated randao reveal.
    assert!(proposals.iter().all(|p| *p == proposals[0]));
    let expected_randao = cluster.group_signature(&SignedData::Randao(SignedEpoch {
        epoch: 2,
        signature: Signature::default(),
    }));
    assert_eq!(proposals[0].block.body.randao_reveal, expected_randao);

    // Clients sign the block and submit it back.
    for (operator, node) in cluster.nodes.iter().enumerate() {
        let unsigned = SignedData::Proposal(SignedProposal {
            version: proposals[0].version,
            blinded: false,
            message: proposals[0].block,
            signature: Signature::default(),
        });
        let signature = cluster.share_sign(&unsigned, operator);
        node.component
            .submit_proposal(false, proposals[0].version, proposals[0].block, signature)
            .await
            .unwrap();
    }

    let beacon = cluster.beacon.clone();
    wait_until(move || beacon.submitted.lock().proposals.len() == CLUSTER_SIZE as usize).await;

    let submitted = cluster.beacon.submitted.lock();
    let first = &submitted.proposals[0];
    assert!(submitted.proposals.iter().all(|p| p == first));
    assert_eq!(first.message.tree_hash_root(), proposals[0].message_root());

    // Exactly one signed block per node, signed by the group key.
    let expected = cluster.group_signature(&SignedData::Proposal(SignedProposal {
        version: first.version,
        blinded: false,
        message: first.message,
        signature: Signature::default(),
    }));
    assert_eq!(first.signature, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn double_sign_is_rejected() {
    let cluster = TestCluster::new(3);
    cluster
        .beacon
        .attester_duties
        .lock()
        .push(cluster.attester_duty(96));

    cluster.tick_all(96).await;

    let node = &cluster.nodes[0];
    let data = node.component.attestation_data(96, 0).await.unwrap();

    // First submission is admitted.
    let attestation = cluster.partial_attestation(data, 0);
    node.component
        .submit_attestations(vec![(attestation, None)], ForkVersion::Deneb)
        .await
        .unwrap();

    // A conflicting payload from the same share is rejected.
    let mut conflicting_data = data;
    conflicting_data.beacon_block_root = Root::repeat_byte(0xbb);
    let conflicting = cluster.partial_attestation(conflicting_data, 0);
    let err = node
        .component
        .submit_attestations(vec![(conflicting, None)], ForkVersion::Deneb)
        .await
        .unwrap_err();
    assert!(err.message.contains("double sign"));

    // No aggregate was produced for either payload.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.beacon.submitted.lock().attestations.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_not_met_yields_no_broadcast() {
    let cluster = TestCluster::new(4);
    cluster
        .beacon
        .attester_duties
        .lock()
        .push(cluster.attester_duty(128));

    cluster.tick_all(128).await;

    // Only two of four operators submit partials.
    for (operator, node) in cluster.nodes.iter().take(2).enumerate() {
        let data = node.component.attestation_data(128, 0).await.unwrap();
        let attestation = cluster.partial_attestation(data, operator);
        node.component
            .submit_attestations(vec![(attestation, None)], ForkVersion::Deneb)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.beacon.submitted.lock().attestations.is_empty());

    // Past the deadline the partial state is garbage collected.
    let duty = dv_types::Duty::attester(128);
    assert!(cluster.nodes[0].par_sig_db.partial_count(duty, cluster.group_pubkey) >= 2);
    for node in &cluster.nodes {
        node.prune_handles.prune(131);
        assert_eq!(node.par_sig_db.partial_count(duty, cluster.group_pubkey), 0);
    }
    assert!(cluster.beacon.submitted.lock().attestations.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_rebroadcast_is_idempotent() {
    let cluster = TestCluster::new(5);
    cluster
        .beacon
        .attester_duties
        .lock()
        .push(cluster.attester_duty(160));

    cluster.tick_all(160).await;

    let node = &cluster.nodes[0];
    let data = node.component.attestation_data(160, 0).await.unwrap();
    let attestation = cluster.partial_attestation(data, 0);
    node.component
        .submit_attestations(vec![(attestation.clone(), None)], ForkVersion::Deneb)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let duty = dv_types::Duty::attester(160);
    let counts: Vec<usize> = cluster
        .nodes
        .iter()
        .map(|n| n.par_sig_db.partial_count(duty, cluster.group_pubkey))
        .collect();

    // Re-broadcasting the identical set changes nothing observable.
    let mut set = dv_types::ParSignedDataSet::new();
    set.insert(
        cluster.group_pubkey,
        dv_types::ParSignedData::new(
            SignedData::Attestation(VersionedAttestation {
                version: ForkVersion::Deneb,
                validator_index: Some(VALIDATOR_INDEX),
                attestation,
            }),
            1,
        ),
    );
    cluster.nodes[0]
        .par_sig_ex
        .broadcast(duty, set)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let counts_after: Vec<usize> = cluster
        .nodes
        .iter()
        .map(|n| n.par_sig_db.partial_count(duty, cluster.group_pubkey))
        .collect();
    assert_eq!(counts, counts_after);
}
