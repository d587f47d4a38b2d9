//! Submits fully signed duty objects to the beacon node.
//!
//! Consumes newly aggregated signatures and submits the broadcastable kinds,
//! retrying transient failures with exponential backoff within the duty
//! deadline. Non-broadcastable kinds (randao reveals, selection proofs)
//! complete silently. Submission happens at most once per `(duty, pubkey)`.

mod metrics;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use beacon_client::{BeaconApi, BeaconError};
use chorus_slot_clock::SlotClock;
use dv_types::{Duty, PubKey, SignedData};

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastError {
    Beacon(BeaconError),
    DeadlineExceeded { duty: Duty },
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastError::Beacon(err) => write!(f, "broadcast failed: {err}"),
            BroadcastError::DeadlineExceeded { duty } => {
                write!(f, "broadcast deadline exceeded for {duty}")
            }
        }
    }
}

impl std::error::Error for BroadcastError {}

pub struct Broadcaster<C: SlotClock> {
    beacon: Arc<dyn BeaconApi>,
    clock: C,
    duty_expiry_slots: u64,
    submitted: Mutex<HashSet<(Duty, PubKey)>>,
}

impl<C: SlotClock> Broadcaster<C> {
    pub fn new(beacon: Arc<dyn BeaconApi>, clock: C, duty_expiry_slots: u64) -> Self {
        Broadcaster {
            beacon,
            clock,
            duty_expiry_slots,
            submitted: Mutex::new(HashSet::new()),
        }
    }

    /// Submits the signed object for a duty, retrying transient failures
    /// while the duty is alive.
    pub async fn broadcast(
        &self,
        duty: Duty,
        pubkey: PubKey,
        data: SignedData,
    ) -> Result<(), BroadcastError> {
        if !duty.kind.is_broadcastable() {
            debug!(%duty, "Duty kind is not broadcast, completing silently");
            return Ok(());
        }

        if !self.submitted.lock().insert((duty, pubkey)) {
            debug!(%duty, %pubkey, "Already submitted, skipping");
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.submit(&data).await {
                Ok(()) => {
                    metrics::BROADCASTS
                        .with_label_values(&[data.kind_label()])
                        .inc();
                    info!(%duty, %pubkey, kind = data.kind_label(), "Broadcast signed duty object");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    if self.past_deadline(duty) {
                        metrics::BROADCAST_FAILURES
                            .with_label_values(&[data.kind_label()])
                            .inc();
                        warn!(%duty, %err, "Giving up broadcast past duty deadline");
                        return Err(BroadcastError::DeadlineExceeded { duty });
                    }
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    warn!(%duty, attempt, %err, "Broadcast failed, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    metrics::BROADCAST_FAILURES
                        .with_label_values(&[data.kind_label()])
                        .inc();
                    error!(%duty, %pubkey, %err, "Broadcast failed");
                    return Err(BroadcastError::Beacon(err));
                }
            }
        }
    }

    fn past_deadline(&self, duty: Duty) -> bool {
        match self.clock.now() {
            Some(slot) => slot > duty.slot + self.duty_expiry_slots,
            None => false,
        }
    }

    async fn submit(&self, data: &SignedData) -> Result<(), BeaconError> {
        match data {
            SignedData::Attestation(att) => {
                self.beacon.submit_attestations(&[att.clone()]).await
            }
            SignedData::Proposal(proposal) => self.beacon.submit_proposal(proposal).await,
            SignedData::AggregateAndProof(aggregate) => {
                self.beacon.submit_aggregates(&[aggregate.clone()]).await
            }
            SignedData::SyncMessage(message) => {
                self.beacon.submit_sync_messages(&[*message]).await
            }
            SignedData::ContributionAndProof(contribution) => {
                self.beacon
                    .submit_contributions(&[contribution.clone()])
                    .await
            }
            SignedData::VoluntaryExit(exit) => self.beacon.submit_voluntary_exit(exit).await,
            SignedData::ValidatorRegistration(registration) => {
                self.beacon.register_validators(&[*registration]).await
            }
            SignedData::Randao(_)
            | SignedData::BeaconCommitteeSelection(_)
            | SignedData::SyncCommitteeSelection(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_client::mock::MockBeacon;
    use chorus_slot_clock::ManualSlotClock;
    use dv_types::eth::{SignedEpoch, SignedVoluntaryExit, VoluntaryExit};
    use dv_types::Signature;
    use std::sync::atomic::Ordering;

    fn exit() -> SignedData {
        SignedData::VoluntaryExit(SignedVoluntaryExit {
            message: VoluntaryExit {
                epoch: 1,
                validator_index: 3,
            },
            signature: Signature([1; 96]),
        })
    }

    fn broadcaster(mock: Arc<MockBeacon>) -> Broadcaster<ManualSlotClock> {
        let clock = ManualSlotClock::new(Duration::from_secs(0), Duration::from_secs(12));
        clock.set_slot(32);
        Broadcaster::new(mock, clock, 2)
    }

    #[tokio::test]
    async fn submits_at_most_once_per_duty() {
        let mock = Arc::new(MockBeacon::default());
        let broadcaster = broadcaster(mock.clone());
        let duty = Duty::voluntary_exit(32);
        let pubkey = PubKey([1; 48]);

        broadcaster.broadcast(duty, pubkey, exit()).await.unwrap();
        broadcaster.broadcast(duty, pubkey, exit()).await.unwrap();

        assert_eq!(mock.submitted.lock().exits.len(), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let mock = Arc::new(MockBeacon::default());
        mock.submit_failures.store(2, Ordering::SeqCst);
        let broadcaster = broadcaster(mock.clone());

        broadcaster
            .broadcast(Duty::voluntary_exit(32), PubKey([1; 48]), exit())
            .await
            .unwrap();
        assert_eq!(mock.submitted.lock().exits.len(), 1);
    }

    #[tokio::test]
    async fn gives_up_past_deadline() {
        let mock = Arc::new(MockBeacon::default());
        mock.submit_failures.store(100, Ordering::SeqCst);
        let clock = ManualSlotClock::new(Duration::from_secs(0), Duration::from_secs(12));
        // The duty's deadline (slot 34) has already passed.
        clock.set_slot(40);
        let broadcaster = Broadcaster::new(mock.clone(), clock, 2);

        let err = broadcaster
            .broadcast(Duty::voluntary_exit(32), PubKey([1; 48]), exit())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BroadcastError::DeadlineExceeded {
                duty: Duty::voluntary_exit(32)
            }
        );
        assert!(mock.submitted.lock().exits.is_empty());
    }

    #[tokio::test]
    async fn non_broadcastable_kinds_complete_silently() {
        let mock = Arc::new(MockBeacon::default());
        let broadcaster = broadcaster(mock.clone());

        broadcaster
            .broadcast(
                Duty::randao(32),
                PubKey([1; 48]),
                SignedData::Randao(SignedEpoch {
                    epoch: 1,
                    signature: Signature([1; 96]),
                }),
            )
            .await
            .unwrap();

        let submitted = mock.submitted.lock();
        assert!(submitted.exits.is_empty());
        assert!(submitted.attestations.is_empty());
    }
}
