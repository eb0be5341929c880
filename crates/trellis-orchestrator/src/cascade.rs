//! Cascade regeneration
//!
//! Marks everything downstream of an edited node stale, then regenerates the
//! stale nodes one at a time in breadth-first order, each run awaited to its
//! terminal frame before the next starts.

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{GenerationOptions, GenerationOrchestrator, GenerationOutcome};
use serde::Serialize;
use trellis_graph::NodeId;

/// What a cascade did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeReport {
    /// Nodes marked stale, in regeneration order
    pub stale: Vec<NodeId>,
    pub regenerated: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    /// Deleted meanwhile, or already generating elsewhere
    pub skipped: Vec<NodeId>,
    /// Node whose cancellation stopped the cascade
    pub cancelled: Option<NodeId>,
}

impl CascadeReport {
    /// Every stale node was regenerated
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.regenerated.len() == self.stale.len()
    }
}

/// Pre-flight errors that are not about the node itself
fn aborts_cascade(err: &OrchestratorError) -> bool {
    matches!(
        err,
        OrchestratorError::ProjectNotFound(_)
            | OrchestratorError::InvalidModelId(_)
            | OrchestratorError::ProviderUnavailable(_)
    )
}

impl GenerationOrchestrator {
    /// Mark the descendants of `root` stale and regenerate them sequentially
    ///
    /// A failed node does not stop the cascade, including one that fails to
    /// start (for instance because storage rejects it); a cancelled one does.
    ///
    /// # Errors
    /// - `OrchestratorError::Graph(NodeNotFound)` for an unknown root
    /// - `ProjectNotFound`, `InvalidModelId` and `ProviderUnavailable`, which
    ///   would fail every remaining node the same way
    pub async fn cascade_regenerate(&self, root: &NodeId, options: GenerationOptions) -> Result<CascadeReport> {
        let stale = self.workspace().lock().cascade_stale(root)?;
        tracing::info!(root = %root, stale = stale.len(), "cascade regeneration started");

        let mut report = CascadeReport {
            stale: stale.clone(),
            ..CascadeReport::default()
        };

        for node_id in stale {
            match self.generate_and_wait(&node_id, options.clone()).await {
                Ok(GenerationOutcome::Completed { .. }) => report.regenerated.push(node_id),
                Ok(GenerationOutcome::Failed(message)) => report.failed.push((node_id, message)),
                Ok(GenerationOutcome::Cancelled) => {
                    tracing::info!(node_id = %node_id, "cascade stopped by cancellation");
                    report.cancelled = Some(node_id);
                    break;
                }
                Err(err) if aborts_cascade(&err) => return Err(err),
                Err(OrchestratorError::AlreadyGenerating(_)) => report.skipped.push(node_id),
                Err(err) if err.is_not_found() => report.skipped.push(node_id),
                Err(err) => {
                    tracing::warn!(node_id = %node_id, error = %err, "cascade node could not start");
                    report.failed.push((node_id, err.to_string()));
                }
            }
        }

        tracing::info!(
            root = %root,
            regenerated = report.regenerated.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "cascade regeneration finished"
        );
        Ok(report)
    }
}
