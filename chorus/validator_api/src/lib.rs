//! Validator-API: the beacon-node surface served to validator clients.
//!
//! Validator clients connect here instead of a real beacon node. Duty
//! endpoints translate group public keys to this operator's public shares,
//! data endpoints block until the cluster agreed on a value, submission
//! endpoints turn share signatures into verified partial signatures, and
//! everything else is reverse-proxied to the upstream beacon node.

mod component;
mod error;
mod router;

#[cfg(test)]
mod tests;

pub use component::{
    prop_data_matches_duty, AwaitAggAttFn, AwaitAggSigFn, AwaitAttDataFn, AwaitProposalFn,
    AwaitSyncContributionFn, BoxError, ClusterValidator, Component, DutyDefFn, ParSigSubscriber,
    ProposerConfigResponse, PubkeyByAttFn,
};
pub use error::ApiError;
pub use router::{router, serve, ApiState};
