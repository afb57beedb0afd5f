//! Selection errors.

use thiserror::Error;

use crate::balancer::NodeId;

/// Reasons a pick can fail. Every variant is an "unavailable" condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PickError {
    /// No connection is currently usable.
    #[error("unavailable: no sub-connection available")]
    NoSubConnAvailable,

    /// The caller asked for a node that is not currently usable.
    #[error("unavailable: requested node not present: {0}")]
    PreferredNodeUnavailable(NodeId),

    /// The exclusion removed every candidate and the policy is to fail.
    #[error("unavailable: all candidates excluded, excluded node: {0}")]
    AllCandidatesExcluded(NodeId),

    /// The balancer was closed.
    #[error("unavailable: balancer closed")]
    Closed,
}

impl PickError {
    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PickError::Closed)
    }

    /// Label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PickError::NoSubConnAvailable => "no_sub_conn",
            PickError::PreferredNodeUnavailable(_) => "preferred_node_unavailable",
            PickError::AllCandidatesExcluded(_) => "all_excluded",
            PickError::Closed => "closed",
        }
    }
}
