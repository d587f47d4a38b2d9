//! Two-phase construction of the duty pipeline.
//!
//! The stages form a cyclic dependency graph at runtime, so construction is
//! split: every stage is first built with only its own state, then wired with
//! register/subscribe callbacks in dependency order (storage leaves first,
//! the validator-API orchestrator last). Wiring is single-threaded and must
//! complete before the scheduler starts ticking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agg_sig_db::AggSigDb;
use beacon_client::{BeaconApi, ValidatorCache};
use broadcaster::Broadcaster;
use chorus_slot_clock::SlotClock;
use consensus::{Consensus, LoopbackConsensus};
use duty_db::DutyDb;
use duty_tracker::{DutyState, Tracker};
use dv_types::eth::ExecutionAddress;
use dv_types::signing::ForkInfo;
use fetcher::{Fetcher, GraffitiBuilder};
use par_sig_db::ParSigDb;
use par_sig_ex::{ExchangeSubscriber, ParSigEx, Transport};
use scheduler::Scheduler;
use sig_agg::{ClusterPubkeys, SigAgg};
use validator_api::{ApiState, ClusterValidator, Component};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// This operator's 1-indexed share index.
    pub share_idx: u64,
    pub cluster_size: u64,
    pub threshold: usize,
    pub duty_expiry_slots: u64,
    pub builder_enabled: bool,
    pub target_gas_limit: u64,
    pub fee_recipient: ExecutionAddress,
    pub graffiti: Option<String>,
    pub insecure_test: bool,
    pub genesis_time: u64,
    pub slot_duration: Duration,
    pub fork_info: ForkInfo,
    /// Upstream beacon node base URL, for proxied requests.
    pub beacon_url: String,
}

/// Handles for pruning all per-duty state past the deadline.
#[derive(Clone)]
pub struct PruneHandles {
    duty_db: Arc<DutyDb>,
    agg_sig_db: Arc<AggSigDb>,
    par_sig_db: Arc<ParSigDb>,
    consensus: Arc<LoopbackConsensus>,
    tracker: Arc<Tracker>,
}

impl PruneHandles {
    pub fn prune(&self, before_slot: u64) {
        self.duty_db.prune(before_slot);
        self.agg_sig_db.prune(before_slot);
        self.par_sig_db.prune(before_slot);
        self.consensus.prune(before_slot);
        self.tracker.prune(before_slot);
    }
}

/// One operator node's fully wired pipeline.
pub struct Pipeline<C: SlotClock> {
    pub scheduler: Arc<Scheduler<C>>,
    pub duty_db: Arc<DutyDb>,
    pub agg_sig_db: Arc<AggSigDb>,
    pub par_sig_db: Arc<ParSigDb>,
    pub par_sig_ex: Arc<ParSigEx>,
    pub component: Arc<Component>,
    pub tracker: Arc<Tracker>,
    pub val_cache: Arc<ValidatorCache>,
    pub prune_handles: PruneHandles,
    pub api_state: ApiState,
}

/// Builds and wires one node of the cluster.
pub fn wire<C: SlotClock>(
    cfg: NodeConfig,
    beacon: Arc<dyn BeaconApi>,
    clock: C,
    validators: Vec<ClusterValidator>,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> Pipeline<C> {
    // Phase one: construct stages with only their own state, leaves first.

    let senders = processor::spawn(processor::Config::default(), shutdown.child_token());
    let tracker = Arc::new(Tracker::new());
    let val_cache = Arc::new(ValidatorCache::new(
        beacon.clone(),
        validators.iter().map(|v| v.group_pubkey).collect(),
    ));
    let duty_db = Arc::new(DutyDb::new(shutdown.child_token()));
    let broadcaster = Arc::new(Broadcaster::new(
        beacon.clone(),
        clock.clone(),
        cfg.duty_expiry_slots,
    ));

    let mut shares_by_key = HashMap::new();
    for validator in &validators {
        let mut by_idx = BTreeMap::new();
        for (i, pubshare) in validator.pubshares.iter().enumerate() {
            by_idx.insert(i as u64 + 1, *pubshare);
        }
        shares_by_key.insert(validator.group_pubkey, by_idx);
    }
    let cluster_pubkeys = Arc::new(ClusterPubkeys { shares_by_key });

    // Phase two: wire with register/subscribe in dependency order.

    // AggSigDB feeds the broadcaster; submission retries run detached so the
    // aggregation path never blocks on the beacon node.
    let mut agg_sig_db = AggSigDb::new(shutdown.child_token());
    {
        let broadcaster = broadcaster.clone();
        let tracker = tracker.clone();
        let beacon_io = senders.beacon_io.clone();
        agg_sig_db.subscribe(Box::new(move |duty, pubkey, data| {
            let broadcaster = broadcaster.clone();
            let tracker = tracker.clone();
            let beacon_io = beacon_io.clone();
            Box::pin(async move {
                tracker.advance(duty, DutyState::Aggregated);
                beacon_io
                    .send_async(
                        async move {
                            match broadcaster.broadcast(duty, pubkey, data).await {
                                Ok(()) => tracker.advance(duty, DutyState::Broadcast),
                                Err(err) => tracker.fail(duty, &err.to_string()),
                            }
                        },
                        "broadcast_signed_duty",
                    )
                    .map_err(|_| "processor queue unavailable")?;
                Ok(())
            })
        }));
    }
    let agg_sig_db = Arc::new(agg_sig_db);

    // SigAgg writes aggregates into AggSigDB.
    let mut sig_agg = SigAgg::new(cfg.threshold, cluster_pubkeys, cfg.fork_info.clone());
    {
        let agg_sig_db = agg_sig_db.clone();
        sig_agg.subscribe(Box::new(move |duty, pubkey, data| {
            let agg_sig_db = agg_sig_db.clone();
            Box::pin(async move {
                agg_sig_db.store(duty, pubkey, data).await?;
                Ok(())
            })
        }));
    }
    let sig_agg = Arc::new(sig_agg);

    // ParSigDB broadcasts local sets through ParSigEx and hands threshold
    // sets to SigAgg. The exchange itself is created afterwards (it consumes
    // the finished ParSigDB), so the broadcast callback resolves it lazily.
    let par_sig_ex_cell: Arc<once_cell::sync::OnceCell<Arc<ParSigEx>>> =
        Arc::new(once_cell::sync::OnceCell::new());
    let mut par_sig_db = ParSigDb::new(cfg.threshold);
    {
        let cell = par_sig_ex_cell.clone();
        par_sig_db.subscribe_internal(Box::new(move |duty, set| {
            let cell = cell.clone();
            Box::pin(async move {
                match cell.get() {
                    Some(par_sig_ex) => par_sig_ex.broadcast(duty, set).await,
                    None => Ok(()),
                }
            })
        }));
    }
    {
        let sig_agg = sig_agg.clone();
        let tracker = tracker.clone();
        par_sig_db.subscribe_threshold(Box::new(move |duty, pubkey, partials| {
            let sig_agg = sig_agg.clone();
            let tracker = tracker.clone();
            Box::pin(async move {
                tracker.advance(duty, DutyState::PartialsCollected);
                sig_agg.aggregate(duty, pubkey, partials).await?;
                Ok(())
            })
        }));
    }
    let par_sig_db = Arc::new(par_sig_db);

    let exchange_subscriber: ExchangeSubscriber = {
        let par_sig_db = par_sig_db.clone();
        Box::new(move |duty, set| {
            let par_sig_db = par_sig_db.clone();
            Box::pin(async move {
                par_sig_db.store_external(duty, set).await?;
                Ok(())
            })
        })
    };
    let par_sig_ex = Arc::new(ParSigEx::spawn(
        transport,
        vec![exchange_subscriber],
        inbound,
        shutdown.child_token(),
    ));
    let _ = par_sig_ex_cell.set(par_sig_ex.clone());

    // Consensus decisions land in DutyDB.
    let mut loopback = LoopbackConsensus::new();
    {
        let duty_db = duty_db.clone();
        let tracker = tracker.clone();
        loopback.subscribe(Box::new(move |duty, set| {
            let duty_db = duty_db.clone();
            let tracker = tracker.clone();
            Box::pin(async move {
                tracker.advance(duty, DutyState::Decided);
                duty_db.store(duty, set)?;
                Ok(())
            })
        }));
    }
    let consensus = Arc::new(loopback);

    // Fetcher pulls prerequisites from AggSigDB/DutyDB and proposes fetched
    // values into consensus.
    let fee_recipient = cfg.fee_recipient;
    let graffiti = match &cfg.graffiti {
        Some(text) => GraffitiBuilder::from_text(text),
        None => GraffitiBuilder::default(),
    };
    let mut fetcher = Fetcher::new(
        beacon.clone(),
        Box::new(move |_| fee_recipient),
        cfg.builder_enabled,
        graffiti,
    );
    {
        let agg_sig_db = agg_sig_db.clone();
        fetcher.register_agg_sig_db(Box::new(move |duty, pubkey| {
            let agg_sig_db = agg_sig_db.clone();
            Box::pin(async move { Ok(agg_sig_db.await_signed(duty, pubkey).await?) })
        }));
    }
    {
        let duty_db = duty_db.clone();
        fetcher.register_await_att_data(Box::new(move |slot, committee_index| {
            let duty_db = duty_db.clone();
            Box::pin(async move { Ok(duty_db.await_att_data(slot, committee_index).await?) })
        }));
    }
    {
        let consensus = consensus.clone();
        let tracker = tracker.clone();
        fetcher.subscribe(Box::new(move |duty, unsigned_set| {
            let consensus = consensus.clone();
            let tracker = tracker.clone();
            Box::pin(async move {
                tracker.advance(duty, DutyState::Fetched);
                consensus.propose(duty, unsigned_set).await
            })
        }));
    }
    let fetcher = Arc::new(fetcher);

    // Scheduler drives the fetcher.
    let mut scheduler = Scheduler::new(
        clock.clone(),
        beacon.clone(),
        val_cache.clone(),
        senders.clone(),
        cfg.duty_expiry_slots,
        shutdown.child_token(),
    );
    {
        let fetcher = fetcher.clone();
        scheduler.subscribe(Box::new(move |duty, def_set| {
            let fetcher = fetcher.clone();
            Box::pin(async move {
                fetcher.fetch(duty, def_set).await?;
                Ok(())
            })
        }));
    }
    let scheduler = Arc::new(scheduler);

    // Validator-API: the orchestrator is wired last.
    let mut component = Component::new(
        beacon,
        val_cache.clone(),
        &validators,
        cfg.share_idx,
        Box::new(move |_| fee_recipient),
        cfg.builder_enabled,
        cfg.target_gas_limit,
        cfg.fork_info.clone(),
        cfg.genesis_time,
        cfg.slot_duration,
        cfg.insecure_test,
    );
    {
        let duty_db = duty_db.clone();
        component.register_await_att_data(Box::new(move |slot, committee_index| {
            let duty_db = duty_db.clone();
            Box::pin(async move { Ok(duty_db.await_att_data(slot, committee_index).await?) })
        }));
    }
    {
        let duty_db = duty_db.clone();
        component.register_await_proposal(Box::new(move |slot| {
            let duty_db = duty_db.clone();
            Box::pin(async move { Ok(duty_db.await_proposal(slot).await?) })
        }));
    }
    {
        let duty_db = duty_db.clone();
        component.register_await_agg_attestation(Box::new(move |slot, root| {
            let duty_db = duty_db.clone();
            Box::pin(async move { Ok(duty_db.await_agg_attestation(slot, root).await?) })
        }));
    }
    {
        let duty_db = duty_db.clone();
        component.register_await_sync_contribution(Box::new(
            move |slot, subcommittee_index, root| {
                let duty_db = duty_db.clone();
                Box::pin(async move {
                    Ok(duty_db
                        .await_sync_contribution(slot, subcommittee_index, root)
                        .await?)
                })
            },
        ));
    }
    {
        let agg_sig_db = agg_sig_db.clone();
        component.register_await_agg_sig(Box::new(move |duty, pubkey| {
            let agg_sig_db = agg_sig_db.clone();
            Box::pin(async move { Ok(agg_sig_db.await_signed(duty, pubkey).await?) })
        }));
    }
    {
        let duty_db = duty_db.clone();
        component.register_pubkey_by_attestation(Box::new(
            move |slot, committee_index, validator_index| {
                let duty_db = duty_db.clone();
                Box::pin(async move {
                    Ok(duty_db.pubkey_by_attestation(slot, committee_index, validator_index)?)
                })
            },
        ));
    }
    {
        let scheduler = scheduler.clone();
        component.register_duty_definition(Box::new(move |duty| {
            let scheduler = scheduler.clone();
            Box::pin(async move { Ok(scheduler.get_duty_definition(duty).await?) })
        }));
    }
    {
        let par_sig_db = par_sig_db.clone();
        component.subscribe(Box::new(move |duty, set| {
            let par_sig_db = par_sig_db.clone();
            Box::pin(async move {
                par_sig_db.store_internal(duty, set).await?;
                Ok(())
            })
        }));
    }
    let component = Arc::new(component);

    let api_state = ApiState::new(component.clone(), cfg.beacon_url.clone(), shutdown.clone());

    let prune_handles = PruneHandles {
        duty_db: duty_db.clone(),
        agg_sig_db: agg_sig_db.clone(),
        par_sig_db: par_sig_db.clone(),
        consensus: consensus.clone(),
        tracker: tracker.clone(),
    };

    // Per-duty state is garbage collected a fixed number of slots past the
    // duty slot.
    {
        let prune_handles = prune_handles.clone();
        let clock = clock.clone();
        let expiry = cfg.duty_expiry_slots;
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let sleep_for = clock
                    .duration_to_next_slot()
                    .unwrap_or(clock.slot_duration());
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.cancelled() => return,
                }
                if let Some(slot) = clock.now() {
                    prune_handles.prune(slot.saturating_sub(expiry));
                }
            }
        });
    }

    Pipeline {
        scheduler,
        duty_db,
        agg_sig_db,
        par_sig_db,
        par_sig_ex,
        component,
        tracker,
        val_cache,
        prune_handles,
        api_state,
    }
}
