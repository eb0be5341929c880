//! Trellis Orchestrator - async generation over a prompt graph
//!
//! Provides:
//! - Model provider registry with fail-fast resolution
//! - Streaming generation with per-node single flight and cancellation
//! - Best-effort summaries, persistence and realtime mirroring
//! - Sequential cascade regeneration of stale descendants
//! - A typed command bus consumed by a single dispatcher
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_orchestrator::prelude::*;
//! use trellis_orchestrator::{InMemoryPersistence, PersistedNode, Project, ProjectId};
//!
//! # async fn demo() -> trellis_orchestrator::Result<()> {
//! let persistence = Arc::new(InMemoryPersistence::new());
//! persistence.insert_project(Project::new("demo", "Demo"));
//!
//! let orchestrator = GenerationOrchestrator::builder("demo")
//!     .persistence(persistence.clone())
//!     .build();
//! let node = {
//!     let mut ws = orchestrator.workspace().lock();
//!     let id = ws.add_node_with_prompt(Point::new(0.0, 0.0), "Hello");
//!     persistence.upsert_node(PersistedNode::from_node(&ProjectId::from("demo"), ws.node(&id).unwrap()));
//!     id
//! };
//! let outcome = orchestrator.generate_and_wait(&node, GenerationOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod broadcast;
pub mod cascade;
pub mod commands;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod persistence;
pub mod stream;

pub use broadcast::{streaming_payload, Broadcaster, NoopBroadcaster, NODE_STREAMING};
pub use cascade::CascadeReport;
pub use commands::{Command, CommandDispatcher, CommandOutcome, CommandSender};
pub use config::{EngineConfig, GenerationConfig};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use llm::{
    collect_text, parse_model_id, qualify_model_id, EchoModel, LanguageModel, ModelHandle, ProviderRegistry, StreamEvent,
    StreamRequest, TextStream, Usage,
};
pub use orchestrator::{
    GenerationOptions, GenerationOrchestrator, GenerationOutcome, OrchestratorBuilder, SharedWorkspace,
};
pub use persistence::{
    InMemoryPersistence, NodeUpdate, PersistedNode, PersistedStatus, Persistence, Project, ProjectId,
};
pub use stream::{progress, AbortSignal, StreamFrame, StreamId, StreamSession};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving generations
    pub use crate::{
        Command, CommandDispatcher, EngineConfig, GenerationOptions, GenerationOrchestrator, GenerationOutcome,
        OrchestratorError, StreamFrame,
    };
    pub use trellis_graph::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
