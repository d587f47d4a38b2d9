//! Runs one operator node: loads the cluster manifest and key shares,
//! builds and wires the duty pipeline, serves the validator API and starts
//! the scheduler.

pub mod config;
pub mod manifest;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use beacon_client::{BeaconApi, HttpBeaconClient};
use chorus_slot_clock::SystemTimeSlotClock;
use par_sig_ex::Transport;

pub use config::Config;
pub use manifest::{load_identity_key, load_key_shares, Manifest};
pub use wire::{wire, NodeConfig, Pipeline, PruneHandles};

const GENESIS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Placeholder transport for deployments without a peer network configured;
/// the real authenticated peer-to-peer transport plugs in behind the same
/// seam.
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn publish(&self, _frame: Vec<u8>) -> BoxFuture<'_, Result<(), par_sig_ex::BoxError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Runs the node until shutdown is cancelled (e.g. by SIGINT).
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), String> {
    info!(
        beacon = config.beacon_url,
        listen = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "Starting chorus node"
    );

    let beacon: Arc<dyn BeaconApi> = Arc::new(
        HttpBeaconClient::new(&config.beacon_url).map_err(|e| e.to_string())?,
    );

    // The beacon node may still be starting; genesis is required before
    // anything else can proceed.
    let genesis = loop {
        match beacon.genesis().await {
            Ok(genesis) => break genesis,
            Err(err) => {
                warn!(%err, "Failed fetching genesis, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(GENESIS_RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    };

    let manifest = Manifest::load(&config.data_dir)?;
    let _identity_key = load_identity_key(&config.data_dir)?;
    let fork_info = manifest.fork_info(genesis.genesis_validators_root)?;

    // Key shares are held by the validator client; loading them here only
    // sanity-checks that this node's shares match the manifest.
    let shares = load_key_shares(&config.data_dir, manifest.validators.len())?;
    for (validator, share) in manifest.validators.iter().zip(&shares) {
        let expected = validator.pubshares[config.operator_index as usize - 1];
        let actual = share.public_key().to_bytes();
        if expected.as_bytes() != &actual {
            return Err(format!(
                "key share mismatch for validator {}: expected pubshare {expected}",
                validator.group_pubkey
            ));
        }
    }

    let fee_recipient = config
        .fee_recipient
        .parse()
        .map_err(|e| format!("invalid fee recipient: {e}"))?;

    let node_config = NodeConfig {
        share_idx: config.operator_index,
        cluster_size: manifest.operators.len() as u64,
        threshold: manifest.threshold,
        duty_expiry_slots: config.duty_expiry_slots,
        builder_enabled: config.builder_enabled,
        target_gas_limit: config.target_gas_limit,
        fee_recipient,
        graffiti: config.graffiti.clone(),
        insecure_test: config.insecure_test_mode,
        genesis_time: genesis.genesis_time,
        slot_duration: config.slot_duration(),
        fork_info,
        beacon_url: config.beacon_url.clone(),
    };

    let clock = SystemTimeSlotClock::new(
        Duration::from_secs(genesis.genesis_time),
        config.slot_duration(),
    );

    // No peer transport configured: inbound frames never arrive and local
    // broadcasts are dropped.
    let (_inbound_tx, inbound) = mpsc::unbounded_channel();
    let pipeline = wire(
        node_config,
        beacon,
        clock,
        manifest.cluster_validators(),
        Arc::new(NoopTransport),
        inbound,
        shutdown.clone(),
    );

    let api = tokio::spawn(validator_api::serve(
        pipeline.api_state.clone(),
        config.listen_addr,
    ));
    tokio::spawn(pipeline.scheduler.clone().run());

    info!("Chorus node started");
    shutdown.cancelled().await;
    info!("Chorus node shutting down");
    let _ = api.await;
    Ok(())
}
