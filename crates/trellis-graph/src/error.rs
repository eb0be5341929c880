//! Error types for the prompt graph

use crate::types::{EdgeId, NodeId};

/// Graph-level errors
///
/// Raised before any mutation happens; an operation that returns one of these
/// leaves the graph untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Unknown node
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Unknown edge
    #[error("edge not found: {0}")]
    EdgeNotFound(EdgeId),

    /// Edge would close a cycle
    #[error("edge {from} -> {to} would create a cycle")]
    CycleRejected { from: NodeId, to: NodeId },

    /// Edge from a node to itself
    #[error("self loop on {0}")]
    SelfLoop(NodeId),

    /// Node carries no plan payload
    #[error("node {0} is not a plan")]
    NotAPlan(NodeId),

    /// Requested plan version does not exist
    #[error("plan {plan} has no version {version}")]
    UnknownPlanVersion { plan: NodeId, version: u32 },

    /// Operation needs a live build session
    #[error("no active build session")]
    NoBuildSession,

    /// Operation needs a session that edits an existing plan
    #[error("build session does not target an existing plan")]
    NotPlanScopeEdit,

    /// Deliverable text required
    #[error("deliverable is empty")]
    EmptyDeliverable,

    /// Inbound remote event failed normalisation
    #[error("invalid remote event: {0}")]
    InvalidRemoteEvent(String),

    /// Structural invariant broken
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl GraphError {
    /// Unknown node or edge
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::EdgeNotFound(_))
    }

    /// Rejected input (as opposed to a missing entity)
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::CycleRejected { .. }
                | Self::SelfLoop(_)
                | Self::EmptyDeliverable
                | Self::InvalidRemoteEvent(_)
                | Self::UnknownPlanVersion { .. }
                | Self::NotAPlan(_)
        )
    }
}
