//! Error types for the orchestrator
//!
//! Every failure maps onto one [`ErrorKind`]:
//! - NotFound: unknown node or project, nothing was mutated
//! - Validation: bad model id, bad config, rejected graph input
//! - ProviderUnavailable: the model provider is not configured
//! - GenerationFailure: the streaming call itself failed
//! - Conflict: the request clashes with live state (already generating, no session)
//! - Persistence: the storage collaborator failed

use trellis_graph::{GraphError, NodeId};

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    ProviderUnavailable,
    GenerationFailure,
    Conflict,
    Persistence,
}

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Graph-level rejection
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Project is unknown to persistence
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// Model id is not `provider:model` or `provider/model`
    #[error("invalid model id: {0}")]
    InvalidModelId(String),

    /// No provider registered under the id's prefix
    #[error("model provider not configured: {0}")]
    ProviderUnavailable(String),

    /// A stream for this node is still live
    #[error("node {0} is already generating")]
    AlreadyGenerating(NodeId),

    /// Language model call failed
    #[error("generation failed: {0}")]
    Generation(String),

    /// Storage collaborator failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration could not be loaded or is out of range
    #[error("configuration error: {0}")]
    Config(String),

    /// Command dispatcher is gone
    #[error("command dispatcher stopped")]
    DispatcherClosed,
}

impl OrchestratorError {
    /// Classify into the error taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Graph(err) if err.is_not_found() => ErrorKind::NotFound,
            Self::Graph(GraphError::NoBuildSession | GraphError::NotPlanScopeEdit) => ErrorKind::Conflict,
            Self::Graph(GraphError::InvariantViolation(_)) => ErrorKind::Conflict,
            Self::Graph(_) | Self::InvalidModelId(_) | Self::Config(_) => ErrorKind::Validation,
            Self::ProjectNotFound(_) => ErrorKind::NotFound,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::AlreadyGenerating(_) | Self::DispatcherClosed => ErrorKind::Conflict,
            Self::Generation(_) => ErrorKind::GenerationFailure,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::Persistence(_) | Self::AlreadyGenerating(_)
        )
    }

    /// Unknown node or project
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result alias for orchestrator operations
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
