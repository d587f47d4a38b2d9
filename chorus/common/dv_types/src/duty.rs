use std::fmt;

use serde::{Deserialize, Serialize};

/// Slots per epoch on all supported networks.
pub const SLOTS_PER_EPOCH: u64 = 32;

/// One obligation of the distributed validator towards the beacon chain,
/// identified by slot and kind. Duties are the unit that flows through the
/// pipeline; all per-duty state is keyed by this value.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Duty {
    pub slot: u64,
    pub kind: DutyKind,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum DutyKind {
    Proposer,
    Attester,
    Aggregator,
    SyncMessage,
    SyncContribution,
    PrepareAggregator,
    PrepareSyncContribution,
    Randao,
    BuilderRegistration,
    VoluntaryExit,
    InfoSync,
    /// Legacy pre-merge builder flow, permanently rejected.
    BuilderProposer,
}

impl Duty {
    pub fn new(slot: u64, kind: DutyKind) -> Self {
        Duty { slot, kind }
    }

    pub fn proposer(slot: u64) -> Self {
        Duty::new(slot, DutyKind::Proposer)
    }

    pub fn attester(slot: u64) -> Self {
        Duty::new(slot, DutyKind::Attester)
    }

    pub fn aggregator(slot: u64) -> Self {
        Duty::new(slot, DutyKind::Aggregator)
    }

    pub fn sync_message(slot: u64) -> Self {
        Duty::new(slot, DutyKind::SyncMessage)
    }

    pub fn sync_contribution(slot: u64) -> Self {
        Duty::new(slot, DutyKind::SyncContribution)
    }

    pub fn prepare_aggregator(slot: u64) -> Self {
        Duty::new(slot, DutyKind::PrepareAggregator)
    }

    pub fn prepare_sync_contribution(slot: u64) -> Self {
        Duty::new(slot, DutyKind::PrepareSyncContribution)
    }

    pub fn randao(slot: u64) -> Self {
        Duty::new(slot, DutyKind::Randao)
    }

    pub fn builder_registration(slot: u64) -> Self {
        Duty::new(slot, DutyKind::BuilderRegistration)
    }

    pub fn voluntary_exit(slot: u64) -> Self {
        Duty::new(slot, DutyKind::VoluntaryExit)
    }

    pub fn info_sync(slot: u64) -> Self {
        Duty::new(slot, DutyKind::InfoSync)
    }

    pub fn epoch(&self) -> u64 {
        self.slot / SLOTS_PER_EPOCH
    }
}

impl DutyKind {
    /// Kinds whose aggregated signed object is submitted to the beacon node.
    pub fn is_broadcastable(&self) -> bool {
        matches!(
            self,
            DutyKind::Attester
                | DutyKind::Proposer
                | DutyKind::Aggregator
                | DutyKind::SyncMessage
                | DutyKind::SyncContribution
                | DutyKind::VoluntaryExit
                | DutyKind::BuilderRegistration
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DutyKind::Proposer => "proposer",
            DutyKind::Attester => "attester",
            DutyKind::Aggregator => "aggregator",
            DutyKind::SyncMessage => "sync_message",
            DutyKind::SyncContribution => "sync_contribution",
            DutyKind::PrepareAggregator => "prepare_aggregator",
            DutyKind::PrepareSyncContribution => "prepare_sync_contribution",
            DutyKind::Randao => "randao",
            DutyKind::BuilderRegistration => "builder_registration",
            DutyKind::VoluntaryExit => "voluntary_exit",
            DutyKind::InfoSync => "info_sync",
            DutyKind::BuilderProposer => "builder_proposer",
        }
    }
}

impl fmt::Display for DutyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.slot, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_display() {
        assert_eq!(Duty::attester(32).to_string(), "32/attester");
        assert_eq!(Duty::randao(64).to_string(), "64/randao");
    }

    #[test]
    fn duty_epoch() {
        assert_eq!(Duty::attester(0).epoch(), 0);
        assert_eq!(Duty::attester(31).epoch(), 0);
        assert_eq!(Duty::attester(32).epoch(), 1);
    }

    #[test]
    fn broadcastable_kinds() {
        assert!(DutyKind::Attester.is_broadcastable());
        assert!(DutyKind::BuilderRegistration.is_broadcastable());
        assert!(!DutyKind::Randao.is_broadcastable());
        assert!(!DutyKind::PrepareAggregator.is_broadcastable());
    }

    #[test]
    fn duty_orders_by_slot_first() {
        assert!(Duty::attester(5) < Duty::attester(6));
    }
}
