//! Command bus
//!
//! Commands arrive as discrete ordered messages on an mpsc channel and are
//! consumed by a single dispatcher task. Each command carries a oneshot for
//! its outcome. Cascades run in their own task so a `cancel-generation` can
//! still be dispatched while one is in progress.

use crate::cascade::CascadeReport;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{GenerationOptions, GenerationOrchestrator};
use crate::persistence::PersistedNode;
use crate::stream::StreamId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use trellis_graph::{GraphError, NodeId, RemoteEvent, Workspace};

/// Named commands accepted by the dispatcher
#[derive(Debug, Clone)]
pub enum Command {
    /// `generate`
    Generate {
        node_id: NodeId,
        options: GenerationOptions,
    },
    /// `cancel-generation`
    CancelGeneration { node_id: NodeId },
    /// `cascade-regenerate`
    CascadeRegenerate {
        root: NodeId,
        options: GenerationOptions,
    },
    /// `ws-create` / `ws-update` / `ws-delete`
    Remote(RemoteEvent),
    /// Plan from the live build session
    BuildPlan { options: GenerationOptions },
    BuildArtifact {
        plan_id: NodeId,
        options: GenerationOptions,
    },
    BuildTodo {
        plan_id: NodeId,
        options: GenerationOptions,
    },
    RefreshPlanVersion {
        plan_id: NodeId,
        options: GenerationOptions,
    },
    /// Stop the dispatcher loop
    Shutdown,
}

impl Command {
    /// Wire name of the command
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate",
            Self::CancelGeneration { .. } => "cancel-generation",
            Self::CascadeRegenerate { .. } => "cascade-regenerate",
            Self::Remote(RemoteEvent::Created { .. }) => "ws-create",
            Self::Remote(RemoteEvent::Updated { .. }) => "ws-update",
            Self::Remote(RemoteEvent::Deleted { .. }) => "ws-delete",
            Self::BuildPlan { .. } => "build-plan",
            Self::BuildArtifact { .. } => "build-artifact",
            Self::BuildTodo { .. } => "build-todo",
            Self::RefreshPlanVersion { .. } => "refresh-plan-version",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result of a dispatched command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// A generation is streaming into `node_id`
    Started { node_id: NodeId, stream_id: StreamId },
    /// Whether a live stream was cancelled
    Cancelled(bool),
    Cascade(CascadeReport),
    /// Remote event folded into the graph
    Applied,
    Stopped,
}

#[derive(Debug)]
struct Envelope {
    command: Command,
    reply: oneshot::Sender<Result<CommandOutcome>>,
}

/// Sending half of the command bus
#[derive(Debug, Clone)]
pub struct CommandSender {
    sender: mpsc::Sender<Envelope>,
}

impl CommandSender {
    /// Submit a command and wait for its outcome
    ///
    /// # Errors
    /// `OrchestratorError::DispatcherClosed` if the dispatcher has stopped,
    /// otherwise whatever the command itself failed with.
    pub async fn send(&self, command: Command) -> Result<CommandOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Envelope { command, reply })
            .await
            .map_err(|_| OrchestratorError::DispatcherClosed)?;
        outcome.await.map_err(|_| OrchestratorError::DispatcherClosed)?
    }
}

/// Single consumer of the command bus
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    orchestrator: GenerationOrchestrator,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(orchestrator: GenerationOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Start the dispatcher task
    #[must_use]
    pub fn spawn(self, capacity: usize) -> (CommandSender, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(receiver));
        (CommandSender { sender }, handle)
    }

    /// Start the dispatcher with the configured queue depth
    #[must_use]
    pub fn start(self) -> (CommandSender, JoinHandle<()>) {
        let capacity = self.orchestrator.config().dispatcher_capacity;
        self.spawn(capacity)
    }

    async fn run(self, mut receiver: mpsc::Receiver<Envelope>) {
        tracing::debug!("command dispatcher started");
        while let Some(Envelope { command, reply }) = receiver.recv().await {
            let name = command.name();
            tracing::debug!(command = name, "dispatching command");

            match command {
                Command::Shutdown => {
                    let _ = reply.send(Ok(CommandOutcome::Stopped));
                    break;
                }
                Command::CascadeRegenerate { root, options } => {
                    let orchestrator = self.orchestrator.clone();
                    tokio::spawn(async move {
                        let result = orchestrator
                            .cascade_regenerate(&root, options)
                            .await
                            .map(CommandOutcome::Cascade);
                        let _ = reply.send(result);
                    });
                }
                command => {
                    let result = self.handle(command).await;
                    if let Err(err) = &result {
                        tracing::warn!(command = name, error = %err, "command failed");
                    }
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!("command dispatcher stopped");
    }

    async fn handle(&self, command: Command) -> Result<CommandOutcome> {
        let orchestrator = &self.orchestrator;
        match command {
            Command::Generate { node_id, options } => self.generate(node_id, options).await,
            Command::CancelGeneration { node_id } => Ok(CommandOutcome::Cancelled(orchestrator.cancel(&node_id).await)),
            Command::Remote(event) => {
                orchestrator.workspace().lock().apply_remote(event)?;
                Ok(CommandOutcome::Applied)
            }
            Command::BuildPlan { options } => {
                let plan_id = {
                    let mut workspace = orchestrator.workspace().lock();
                    plan_from_session(&mut workspace)?
                };
                self.persist_derived(&plan_id).await?;
                self.generate(plan_id, options).await
            }
            Command::BuildArtifact { plan_id, options } => {
                let id = orchestrator
                    .workspace()
                    .lock()
                    .generate_artifact_from_plan(&plan_id)?;
                self.persist_derived(&id).await?;
                self.generate(id, options).await
            }
            Command::BuildTodo { plan_id, options } => {
                let id = orchestrator.workspace().lock().generate_todo_from_plan(&plan_id)?;
                self.persist_derived(&id).await?;
                self.generate(id, options).await
            }
            Command::RefreshPlanVersion { plan_id, options } => {
                let version = orchestrator.workspace().lock().refresh_plan_version(&plan_id)?;
                tracing::debug!(plan_id = %plan_id, version, "regenerating refreshed plan");
                self.generate(plan_id, options).await
            }
            Command::CascadeRegenerate { root, options } => orchestrator
                .cascade_regenerate(&root, options)
                .await
                .map(CommandOutcome::Cascade),
            Command::Shutdown => Ok(CommandOutcome::Stopped),
        }
    }

    async fn generate(&self, node_id: NodeId, options: GenerationOptions) -> Result<CommandOutcome> {
        let stream_id = self.orchestrator.start_generation(&node_id, options).await?;
        Ok(CommandOutcome::Started { node_id, stream_id })
    }

    /// Store a freshly derived node and its incoming edges in one transaction
    async fn persist_derived(&self, id: &NodeId) -> Result<()> {
        let (record, parents) = {
            let workspace = self.orchestrator.workspace().lock();
            let node = workspace
                .node(id)
                .ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
            (
                PersistedNode::from_node(self.orchestrator.project_id(), node),
                node.parent_ids.clone(),
            )
        };
        self.orchestrator
            .persistence()
            .create_node_with_edges(record, &parents)
            .await
    }
}

fn plan_from_session(workspace: &mut Workspace) -> Result<NodeId> {
    let session = workspace.build_session().ok_or(GraphError::NoBuildSession)?;
    if session.deliverable().trim().is_empty() {
        return Err(GraphError::EmptyDeliverable.into());
    }
    workspace
        .generate_plan_from_build_session()
        .ok_or_else(|| GraphError::NoBuildSession.into())
}
