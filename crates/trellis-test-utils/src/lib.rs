//! Testing utilities for the trellis workspace
//!
//! Scripted language models, a recording broadcaster and graph fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis_graph::{Node, NodeId, Point, Workspace};
use trellis_orchestrator::{
    Broadcaster, GenerationConfig, GenerationOrchestrator, InMemoryPersistence, LanguageModel, OrchestratorError,
    PersistedNode, Project, ProjectId, ProviderRegistry, StreamEvent, StreamFrame, StreamRequest, TextStream, Usage,
};

type Item = Result<StreamEvent, OrchestratorError>;

#[derive(Debug)]
enum Script {
    Live(mpsc::UnboundedReceiver<Item>),
    Canned(Vec<Item>),
    Refuse(String),
}

/// Test side of a live script: push events while the stream is being consumed
///
/// Dropping the feed ends the stream.
#[derive(Debug, Clone)]
pub struct ScriptFeed {
    sender: mpsc::UnboundedSender<Item>,
}

impl ScriptFeed {
    pub fn chunk(&self, text: &str) {
        let _ = self.sender.send(Ok(StreamEvent::Delta(text.to_string())));
    }

    pub fn finish(&self, tokens: u32) {
        let _ = self.sender.send(Ok(StreamEvent::Finish(Usage { total_tokens: tokens })));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.sender.send(Err(OrchestratorError::Generation(message.to_string())));
    }
}

/// Model that plays queued scripts, one per `stream_text` call
#[derive(Debug, Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script driven by the returned feed
    #[must_use]
    pub fn push_script(&self) -> ScriptFeed {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(Script::Live(receiver));
        ScriptFeed { sender }
    }

    /// Queue a complete reply
    pub fn push_reply(&self, chunks: &[&str], tokens: u32) {
        let mut items: Vec<Item> = chunks
            .iter()
            .map(|c| Ok(StreamEvent::Delta((*c).to_string())))
            .collect();
        items.push(Ok(StreamEvent::Finish(Usage { total_tokens: tokens })));
        self.scripts.lock().push_back(Script::Canned(items));
    }

    /// Queue a reply that streams `chunks` and then errors
    pub fn push_stream_error(&self, chunks: &[&str], message: &str) {
        let mut items: Vec<Item> = chunks
            .iter()
            .map(|c| Ok(StreamEvent::Delta((*c).to_string())))
            .collect();
        items.push(Err(OrchestratorError::Generation(message.to_string())));
        self.scripts.lock().push_back(Script::Canned(items));
    }

    /// Queue a call that fails before streaming anything
    pub fn push_refusal(&self, message: &str) {
        self.scripts.lock().push_back(Script::Refuse(message.to_string()));
    }

    /// Requests seen so far, in call order
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    #[must_use]
    pub fn pending_scripts(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream_text(&self, request: StreamRequest) -> Result<TextStream, OrchestratorError> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Live(receiver)) => Ok(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed()),
            Some(Script::Canned(items)) => Ok(stream::iter(items).boxed()),
            Some(Script::Refuse(message)) => Err(OrchestratorError::Generation(message)),
            None => Err(OrchestratorError::Generation("no script queued".to_string())),
        }
    }
}

/// Model whose every call fails up front
#[derive(Debug, Clone)]
pub struct FailingModel {
    pub message: String,
}

impl FailingModel {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for FailingModel {
    async fn stream_text(&self, _request: StreamRequest) -> Result<TextStream, OrchestratorError> {
        Err(OrchestratorError::Generation(self.message.clone()))
    }
}

/// One captured broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub project: ProjectId,
    pub event: String,
    pub payload: Value,
}

/// Broadcaster that keeps everything it is asked to emit
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<Emitted>>,
}

impl RecordingBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Emitted> {
        self.events.lock().clone()
    }

    /// Frames mirrored for one node, decoded back into [`StreamFrame`]s
    #[must_use]
    pub fn frames_for(&self, node_id: &NodeId) -> Vec<StreamFrame> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.payload.get("nodeId").and_then(Value::as_str) == Some(node_id.as_str()))
            .filter_map(|e| serde_json::from_value(e.payload.clone()).ok())
            .collect()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn emit_to_project(&self, project: &ProjectId, event: &str, payload: Value) {
        self.events.lock().push(Emitted {
            project: project.clone(),
            event: event.to_string(),
            payload,
        });
    }
}

/// Provider prefix the harness registers its scripted model under
pub const TEST_PROVIDER: &str = "test";

/// Orchestrator wired to scripted collaborators
#[derive(Debug)]
pub struct Harness {
    pub orchestrator: GenerationOrchestrator,
    pub persistence: Arc<InMemoryPersistence>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub model: Arc<ScriptedModel>,
    pub project: ProjectId,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GenerationConfig::default())
    }

    /// Harness whose default model is the scripted one
    #[must_use]
    pub fn with_config(mut config: GenerationConfig) -> Self {
        config.default_model = format!("{TEST_PROVIDER}:scripted");
        let project = ProjectId::from("project-1");
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_project(Project::new(project.0.clone(), "Test project"));
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let model = Arc::new(ScriptedModel::new());
        let providers = ProviderRegistry::with_echo();
        providers.register(TEST_PROVIDER, model.clone());

        let orchestrator = GenerationOrchestrator::builder(project.clone())
            .providers(Arc::new(providers))
            .persistence(persistence.clone())
            .broadcaster(broadcaster.clone())
            .config(config)
            .build();

        Self {
            orchestrator,
            persistence,
            broadcaster,
            model,
            project,
        }
    }

    /// Add a root node to the workspace and storage
    pub fn add_node(&self, prompt: &str) -> NodeId {
        let id = self
            .orchestrator
            .workspace()
            .lock()
            .add_node_with_prompt(Point::default(), prompt);
        self.mirror(&id);
        id
    }

    /// Add a child node to the workspace and storage
    pub fn add_child(&self, parent: &NodeId, prompt: &str) -> NodeId {
        let id = self
            .orchestrator
            .workspace()
            .lock()
            .create_child_node(parent, prompt, None)
            .unwrap_or_else(|| panic!("parent {parent} missing"));
        self.mirror(&id);
        id
    }

    /// Copy the workspace node into storage
    pub fn mirror(&self, id: &NodeId) {
        let workspace = self.orchestrator.workspace().lock();
        if let Some(node) = workspace.node(id) {
            self.persistence.upsert_node(PersistedNode::from_node(&self.project, node));
        }
    }

    /// Snapshot of a workspace node
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Node {
        self.orchestrator
            .workspace()
            .lock()
            .node(id)
            .cloned()
            .unwrap_or_else(|| panic!("node {id} missing"))
    }

    /// Stored record of a node
    #[must_use]
    pub fn persisted(&self, id: &NodeId) -> PersistedNode {
        self.persistence
            .node_snapshot(id)
            .unwrap_or_else(|| panic!("node {id} not persisted"))
    }

    /// Wait until no stream is live
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.orchestrator.active_streams() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        panic!("streams still live after settling");
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// `root -> n1 -> n2 -> ...` with `len` nodes in total
pub fn chain(workspace: &mut Workspace, len: usize) -> Vec<NodeId> {
    let mut ids = vec![workspace.add_node_with_prompt(Point::default(), "node 0")];
    for i in 1..len {
        let parent = ids[i - 1].clone();
        let child = workspace
            .create_child_node(&parent, format!("node {i}"), None)
            .unwrap_or_else(|| panic!("parent {parent} missing"));
        ids.push(child);
    }
    ids
}

/// `a -> b`, `a -> c`, `b -> d`, `c -> d`
pub fn diamond(workspace: &mut Workspace) -> [NodeId; 4] {
    let a = workspace.add_node_with_prompt(Point::new(0.0, 0.0), "a");
    let b = workspace.add_node_with_prompt(Point::new(-100.0, 200.0), "b");
    let c = workspace.add_node_with_prompt(Point::new(100.0, 200.0), "c");
    let d = workspace.add_node_with_prompt(Point::new(0.0, 400.0), "d");
    for (source, target) in [(&a, &b), (&a, &c), (&b, &d), (&c, &d)] {
        workspace.add_edge(source, target);
    }
    [a, b, c, d]
}
