//! Per-duty progress tracking.
//!
//! Every stage reports the duties it advances; the tracker enforces the
//! monotonic state machine `Pending → Fetched → Decided → PartialsCollected →
//! Aggregated → Broadcast → Done` (or `Failed`), logs a summary when a duty
//! completes, and reports duties that expire without completing.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{debug, info, warn};

use dv_types::Duty;

static DUTIES_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_tracker_duties_total",
        "Duties by terminal state",
        &["kind", "state"]
    )
    .expect("metric can be created")
});

/// Pipeline progress of one duty. Transitions are monotonic; stale reports
/// are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DutyState {
    Pending,
    Fetched,
    Decided,
    PartialsCollected,
    Aggregated,
    Broadcast,
    Done,
    Failed,
}

impl DutyState {
    fn as_str(&self) -> &'static str {
        match self {
            DutyState::Pending => "pending",
            DutyState::Fetched => "fetched",
            DutyState::Decided => "decided",
            DutyState::PartialsCollected => "partials_collected",
            DutyState::Aggregated => "aggregated",
            DutyState::Broadcast => "broadcast",
            DutyState::Done => "done",
            DutyState::Failed => "failed",
        }
    }
}

#[derive(Default)]
pub struct Tracker {
    duties: Mutex<HashMap<Duty, DutyState>>,
}

impl Tracker {
    pub fn new() -> Self {
        Tracker::default()
    }

    /// Advances a duty's state. Backwards transitions are ignored; `Failed`
    /// is terminal and never overwritten by later progress.
    pub fn advance(&self, duty: Duty, state: DutyState) {
        let mut duties = self.duties.lock();
        let current = duties.entry(duty).or_insert(DutyState::Pending);

        if *current == DutyState::Failed || state <= *current {
            debug!(%duty, current = current.as_str(), reported = state.as_str(), "Ignoring stale duty transition");
            return;
        }

        *current = state;
        debug!(%duty, state = state.as_str(), "Duty advanced");

        if state == DutyState::Broadcast {
            // Broadcast is the pipeline's final act for a duty.
            *current = DutyState::Done;
            DUTIES_COMPLETED
                .with_label_values(&[duty.kind.as_str(), DutyState::Done.as_str()])
                .inc();
            info!(%duty, "Duty completed");
        }
    }

    pub fn fail(&self, duty: Duty, reason: &str) {
        let mut duties = self.duties.lock();
        let current = duties.entry(duty).or_insert(DutyState::Pending);
        if matches!(*current, DutyState::Done | DutyState::Failed) {
            return;
        }
        warn!(%duty, last_state = current.as_str(), reason, "Duty failed");
        DUTIES_COMPLETED
            .with_label_values(&[duty.kind.as_str(), DutyState::Failed.as_str()])
            .inc();
        *current = DutyState::Failed;
    }

    pub fn state(&self, duty: Duty) -> Option<DutyState> {
        self.duties.lock().get(&duty).copied()
    }

    /// Drops duties before `before_slot`, reporting the ones that never
    /// completed as deadline failures.
    pub fn prune(&self, before_slot: u64) {
        let mut duties = self.duties.lock();
        duties.retain(|duty, state| {
            if duty.slot >= before_slot {
                return true;
            }
            if !matches!(*state, DutyState::Done | DutyState::Failed) {
                warn!(%duty, last_state = state.as_str(), "Duty expired before completing");
                DUTIES_COMPLETED
                    .with_label_values(&[duty.kind.as_str(), DutyState::Failed.as_str()])
                    .inc();
            }
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        let tracker = Tracker::new();
        let duty = Duty::attester(32);

        tracker.advance(duty, DutyState::Decided);
        assert_eq!(tracker.state(duty), Some(DutyState::Decided));

        // A late fetch report does not move the duty backwards.
        tracker.advance(duty, DutyState::Fetched);
        assert_eq!(tracker.state(duty), Some(DutyState::Decided));

        tracker.advance(duty, DutyState::Aggregated);
        assert_eq!(tracker.state(duty), Some(DutyState::Aggregated));
    }

    #[test]
    fn broadcast_completes_the_duty() {
        let tracker = Tracker::new();
        let duty = Duty::attester(32);
        tracker.advance(duty, DutyState::Broadcast);
        assert_eq!(tracker.state(duty), Some(DutyState::Done));
    }

    #[test]
    fn failed_is_terminal() {
        let tracker = Tracker::new();
        let duty = Duty::proposer(64);
        tracker.fail(duty, "fetch failed");
        tracker.advance(duty, DutyState::Aggregated);
        assert_eq!(tracker.state(duty), Some(DutyState::Failed));
    }

    #[test]
    fn prune_drops_and_reports_incomplete() {
        let tracker = Tracker::new();
        let stale = Duty::attester(5);
        let live = Duty::attester(40);
        tracker.advance(stale, DutyState::Fetched);
        tracker.advance(live, DutyState::Fetched);

        tracker.prune(35);
        assert_eq!(tracker.state(stale), None);
        assert_eq!(tracker.state(live), Some(DutyState::Fetched));
    }
}
