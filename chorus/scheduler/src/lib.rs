//! Slot-ticked duty scheduler.
//!
//! Drives the pipeline from the beacon chain's wall clock: resolves the
//! cluster's duties at every epoch transition, emits duty definitions on
//! their slot, re-emits duties whose fetch failed until their deadline, and
//! trims the validator cache on epoch boundaries.

mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beacon_client::{BeaconApi, ValidatorCache};
use chorus_slot_clock::SlotClock;
use dv_types::{
    Duty, DutyDefinition, DutyDefinitionSet, DutyKind, PubKey, SLOTS_PER_EPOCH,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked per emitted duty with its own copy of the definition set. An error
/// return re-queues the duty for the next slot tick until its deadline.
pub type DutySubscriber =
    Box<dyn Fn(Duty, DutyDefinitionSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Attempts per epoch at resolving duties from the beacon node.
const RESOLVE_RETRIES: usize = 3;
const RESOLVE_BACKOFF: Duration = Duration::from_secs(1);

const DUTY_EMISSION_NAME: &str = "duty_emission";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    Cancelled,
    /// The duty's deadline passed without a definition being resolved.
    NotFound { duty: Duty },
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Cancelled => write!(f, "scheduler await cancelled"),
            SchedulerError::NotFound { duty } => {
                write!(f, "no duty definition resolved for {duty}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

type WaiterId = u64;

#[derive(Default)]
struct Inner {
    next_waiter_id: WaiterId,
    definitions: HashMap<Duty, DutyDefinitionSet>,
    waiters: Vec<(WaiterId, Duty, oneshot::Sender<DutyDefinitionSet>)>,
    /// Duties whose subscriber failed, re-emitted on the next tick.
    retries: Vec<Duty>,
    last_resolved_epoch: Option<u64>,
}

pub struct Scheduler<C: SlotClock> {
    clock: C,
    beacon: Arc<dyn BeaconApi>,
    val_cache: Arc<ValidatorCache>,
    processor: processor::Senders,
    inner: Mutex<Inner>,
    subscribers: Vec<DutySubscriber>,
    duty_expiry_slots: u64,
    shutdown: CancellationToken,
}

impl<C: SlotClock> Scheduler<C> {
    pub fn new(
        clock: C,
        beacon: Arc<dyn BeaconApi>,
        val_cache: Arc<ValidatorCache>,
        processor: processor::Senders,
        duty_expiry_slots: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Scheduler {
            clock,
            beacon,
            val_cache,
            processor,
            inner: Mutex::new(Inner::default()),
            subscribers: Vec::new(),
            duty_expiry_slots,
            shutdown,
        }
    }

    /// Registers a duty subscriber. Must be called before [`Scheduler::run`].
    pub fn subscribe(&mut self, subscriber: DutySubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Blocking lookup of a duty's definition set; resolves as soon as the
    /// scheduler has resolved the slot, returns not-found only after the
    /// duty's deadline passed.
    pub async fn get_duty_definition(
        &self,
        duty: Duty,
    ) -> Result<DutyDefinitionSet, SchedulerError> {
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if let Some(set) = inner.definitions.get(&duty) {
                return Ok(set.clone());
            }
            inner.next_waiter_id += 1;
            let id = inner.next_waiter_id;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((id, duty, tx));
            (id, rx)
        };

        tokio::select! {
            result = rx => result.map_err(|_| SchedulerError::NotFound { duty }),
            _ = self.shutdown.cancelled() => {
                self.inner.lock().waiters.retain(|(waiter_id, _, _)| *waiter_id != id);
                Err(SchedulerError::Cancelled)
            }
        }
    }

    /// Runs the slot loop until shutdown. Tolerates beacon-node failures with
    /// bounded retries per epoch and keeps ticking.
    pub async fn run(self: Arc<Self>) {
        info!("Scheduler started");
        loop {
            let sleep_for = self
                .clock
                .duration_to_next_slot()
                .unwrap_or(self.clock.slot_duration());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    return;
                }
            }

            let Some(slot) = self.clock.now() else {
                continue;
            };
            self.tick(slot).await;
        }
    }

    /// One slot tick: epoch maintenance, duty emission, state pruning.
    /// Exposed for tests driving a manual clock.
    pub async fn tick(self: &Arc<Self>, slot: u64) {
        metrics::CURRENT_SLOT.set(slot as i64);
        let epoch = slot / SLOTS_PER_EPOCH;

        let resolved = { self.inner.lock().last_resolved_epoch };
        if resolved != Some(epoch) {
            // Epoch transition: the validator cache is trimmed here and only
            // here, then refilled lazily.
            self.val_cache.trim();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.resolve_epoch(slot, epoch).await {
                    Ok(()) => {
                        self.inner.lock().last_resolved_epoch = Some(epoch);
                        break;
                    }
                    Err(err) if attempt < RESOLVE_RETRIES => {
                        warn!(epoch, attempt, %err, "Duty resolution failed, retrying");
                        tokio::time::sleep(RESOLVE_BACKOFF).await;
                    }
                    Err(err) => {
                        error!(epoch, %err, "Duty resolution failed, continuing to tick");
                        break;
                    }
                }
            }
        }

        self.emit_slot(slot).await;

        let expiry = slot.saturating_sub(self.duty_expiry_slots);
        self.prune(expiry);
    }

    /// Fetches attester, proposer and sync-committee duties for the epoch and
    /// stores the derived definition sets.
    async fn resolve_epoch(&self, slot: u64, epoch: u64) -> Result<(), BoxError> {
        let (active, _, refreshed_by_slot) = self.val_cache.get_by_slot(slot).await?;
        if !refreshed_by_slot {
            debug!(slot, "Validator cache refreshed from head state");
        }
        if active.is_empty() {
            info!(epoch, "No active validators in cluster");
            return Ok(());
        }

        let by_index: HashMap<u64, PubKey> = active.iter().map(|(k, v)| (*k, *v)).collect();
        let indices: Vec<u64> = by_index.keys().copied().collect();

        let attester = self.beacon.attester_duties(epoch, &indices).await?;
        let proposer = self.beacon.proposer_duties(epoch).await?;
        let sync = self.beacon.sync_committee_duties(epoch, &indices).await?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for duty in attester {
            let Some(pubkey) = by_index.get(&duty.validator_index) else {
                continue;
            };
            // The same definition backs the attestation itself and the
            // aggregation flow for that slot.
            for kind in [DutyKind::Attester, DutyKind::Aggregator, DutyKind::PrepareAggregator] {
                inner
                    .definitions
                    .entry(Duty::new(duty.slot, kind))
                    .or_default()
                    .insert(*pubkey, DutyDefinition::Attester(duty));
            }
        }

        for duty in proposer {
            let Some(pubkey) = by_index.get(&duty.validator_index) else {
                continue;
            };
            inner
                .definitions
                .entry(Duty::proposer(duty.slot))
                .or_default()
                .insert(*pubkey, DutyDefinition::Proposer(duty));
        }

        for duty in sync {
            let Some(pubkey) = by_index.get(&duty.validator_index).copied() else {
                continue;
            };
            // Sync-committee members produce a message every slot of the
            // epoch, and may aggregate per slot too.
            for offset in 0..SLOTS_PER_EPOCH {
                let msg_slot = epoch * SLOTS_PER_EPOCH + offset;
                for kind in [
                    DutyKind::SyncMessage,
                    DutyKind::SyncContribution,
                    DutyKind::PrepareSyncContribution,
                ] {
                    inner
                        .definitions
                        .entry(Duty::new(msg_slot, kind))
                        .or_default()
                        .insert(pubkey, DutyDefinition::SyncCommittee(duty.clone()));
                }
            }
        }

        // Resolve pending definition waiters under the same lock.
        let mut kept = Vec::with_capacity(inner.waiters.len());
        let mut resolved = Vec::new();
        for (id, duty, tx) in inner.waiters.drain(..) {
            if let Some(set) = inner.definitions.get(&duty) {
                resolved.push((tx, set.clone()));
            } else {
                kept.push((id, duty, tx));
            }
        }
        inner.waiters = kept;
        drop(guard);

        for (tx, set) in resolved {
            let _ = tx.send(set);
        }

        info!(epoch, "Resolved cluster duties");
        Ok(())
    }

    /// Emits the current slot's duties plus any retryable duties still within
    /// their deadline.
    async fn emit_slot(self: &Arc<Self>, slot: u64) {
        let mut to_emit: Vec<(Duty, DutyDefinitionSet)> = Vec::new();
        {
            let mut inner = self.inner.lock();

            let retries = std::mem::take(&mut inner.retries);
            for duty in retries {
                if duty.slot + self.duty_expiry_slots < slot {
                    warn!(%duty, "Dropping duty past deadline");
                    continue;
                }
                if let Some(set) = inner.definitions.get(&duty) {
                    to_emit.push((duty, set.clone()));
                }
            }

            for (duty, set) in inner.definitions.iter() {
                if duty.slot == slot && emitted_by_scheduler(duty.kind) {
                    to_emit.push((*duty, set.clone()));
                }
            }
        }

        for (duty, set) in to_emit {
            metrics::DUTIES_EMITTED
                .with_label_values(&[duty.kind.as_str()])
                .inc();
            let scheduler = Arc::clone(self);
            // Each duty flows as its own work item: fetchers block on
            // cross-stage rendezvous and must not stall the slot loop.
            let result = self.processor.urgent_duty.send_async(
                async move {
                    for subscriber in &scheduler.subscribers {
                        if let Err(err) = subscriber(duty, set.clone()).await {
                            warn!(%duty, %err, "Duty emission failed, queuing retry");
                            scheduler.inner.lock().retries.push(duty);
                            break;
                        }
                    }
                },
                DUTY_EMISSION_NAME,
            );
            if result.is_err() {
                self.inner.lock().retries.push(duty);
            }
        }
    }

    /// Drops definitions and waiters for slots before `before_slot`. Waiters
    /// resolve with not-found, which is only reported after the deadline.
    fn prune(&self, before_slot: u64) {
        let mut inner = self.inner.lock();
        inner.definitions.retain(|duty, _| duty.slot >= before_slot);
        inner.waiters.retain(|(_, duty, _)| duty.slot >= before_slot);
        inner.retries.retain(|duty| duty.slot >= before_slot);
    }
}

/// Duty kinds the scheduler emits on their slot; the remaining kinds enter
/// the pipeline through validator-client submissions.
fn emitted_by_scheduler(kind: DutyKind) -> bool {
    matches!(
        kind,
        DutyKind::Attester
            | DutyKind::Proposer
            | DutyKind::Aggregator
            | DutyKind::SyncMessage
            | DutyKind::SyncContribution
    )
}
