//! Trellis Graph - the prompt graph state container
//!
//! Owns everything that mutates synchronously:
//! - Nodes and edges with bidirectional link consistency
//! - Staleness cascades after prompt edits
//! - Coalesced undo/redo history
//! - Context aggregation for generation
//! - Build sessions that curate a scored sub-graph into plans and artifacts
//! - Reconciliation of remote (realtime) node events
//!
//! # Example
//!
//! ```rust
//! use trellis_graph::{Point, Workspace};
//!
//! let mut ws = Workspace::default();
//! let root = ws.add_node_with_prompt(Point::new(0.0, 0.0), "Design a cache");
//! let child = ws.create_child_node(&root, "Which eviction policy?", None).unwrap();
//!
//! ws.update_node_prompt(&root, "Design a distributed cache");
//! assert_eq!(ws.node(&child).unwrap().status, trellis_graph::NodeStatus::Stale);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod build;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod heuristics;
pub mod history;
pub mod prompts;
pub mod remote;
pub mod scope;
pub mod store;
pub mod types;
pub mod workspace;

pub use build::BuildSession;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BuildConfig, GraphConfig};
pub use context::{ChatMessage, ChatRole, ContextAggregator};
pub use error::GraphError;
pub use history::{HistoryManager, HistorySnapshot};
pub use remote::{RemoteEvent, RemoteNodePayload};
pub use scope::{Direction, HeuristicScorer, ScopeEntry, ScopePlacement, ScopeScorer, ScoreResult, Tier};
pub use store::{GraphStore, NodePatch};
pub use types::{
    ArtifactKind, ArtifactPayload, Edge, EdgeId, GenerationMeta, Mode, Node, NodeId, NodeStatus,
    Orchestration, PlanPayload, PlanVersion, Point, Role, SourceExcerpt, SourcePayload, TodoItem,
};
pub use workspace::{GenerationOutput, Workspace};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the prompt graph
    pub use crate::{
        Direction, GraphConfig, GraphError, Node, NodeId, NodeStatus, Point, Role, Workspace,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
