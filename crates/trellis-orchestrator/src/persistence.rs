//! Persistence seam
//!
//! The orchestrator only needs reads by id, a node update and one
//! transactional "create node + edges + bump counts" call. Each call is
//! assumed strongly consistent on its own; nothing spans calls.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use trellis_graph::{Node, NodeId, NodeStatus, Orchestration};

/// Project identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored project record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub system_prompt: Option<String>,
    pub node_count: u64,
    pub edge_count: u64,
}

impl Project {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProjectId(id.into()),
            name: name.into(),
            system_prompt: None,
            node_count: 0,
            edge_count: 0,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Status vocabulary on the storage side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistedStatus {
    #[default]
    Idle,
    Generating,
    Completed,
    Error,
    Stale,
}

impl From<NodeStatus> for PersistedStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Idle => Self::Idle,
            NodeStatus::Loading => Self::Generating,
            NodeStatus::Error => Self::Error,
            NodeStatus::Stale => Self::Stale,
        }
    }
}

impl PersistedStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stale => "stale",
        }
    }
}

/// Stored node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub prompt: String,
    pub response: String,
    pub summary: Option<String>,
    pub status: PersistedStatus,
    pub orchestration: Orchestration,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub tokens: Option<u32>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedNode {
    /// Storage record mirroring a graph node
    #[must_use]
    pub fn from_node(project: &ProjectId, node: &Node) -> Self {
        let generation = &node.orchestration.generation;
        Self {
            id: node.id.clone(),
            project_id: project.clone(),
            prompt: node.prompt.clone(),
            response: node.response.clone(),
            summary: node.summary.clone(),
            status: node.status.into(),
            orchestration: node.orchestration.clone(),
            model: generation.model.clone(),
            temperature: generation.temperature,
            tokens: generation.tokens,
            last_error: generation.last_error.clone(),
            updated_at: node.updated_at,
        }
    }
}

/// Partial node update; `None` leaves a field alone
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeUpdate {
    pub prompt: Option<String>,
    pub response: Option<String>,
    /// `Some(None)` clears the summary
    pub summary: Option<Option<String>>,
    pub status: Option<PersistedStatus>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub tokens: Option<u32>,
    pub last_error: Option<String>,
}

impl NodeUpdate {
    #[must_use]
    pub fn status(status: PersistedStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Storage collaborator
#[async_trait]
pub trait Persistence: Send + Sync + Debug {
    /// # Errors
    /// `OrchestratorError::Persistence` on storage failure.
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>>;

    /// # Errors
    /// `OrchestratorError::Persistence` on storage failure.
    async fn node(&self, id: &NodeId) -> Result<Option<PersistedNode>>;

    /// # Errors
    /// `OrchestratorError::Persistence` for unknown nodes or storage failure.
    async fn update_node(&self, id: &NodeId, update: NodeUpdate) -> Result<()>;

    /// Insert a node plus `parent -> node` edges and bump the project counters
    ///
    /// All or nothing.
    ///
    /// # Errors
    /// - `OrchestratorError::ProjectNotFound`
    /// - `OrchestratorError::Persistence` for a duplicate id or unknown parent
    async fn create_node_with_edges(&self, node: PersistedNode, parents: &[NodeId]) -> Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    nodes: HashMap<NodeId, PersistedNode>,
    edges: Vec<(NodeId, NodeId)>,
}

/// Process-local persistence
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    tables: RwLock<Tables>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.tables.write().projects.insert(project.id.clone(), project);
    }

    /// Store a node outside the transactional path (seeding, imports)
    pub fn upsert_node(&self, node: PersistedNode) {
        self.tables.write().nodes.insert(node.id.clone(), node);
    }

    /// Persisted `(source, target)` pairs
    #[must_use]
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.tables.read().edges.clone()
    }

    #[must_use]
    pub fn node_snapshot(&self, id: &NodeId) -> Option<PersistedNode> {
        self.tables.read().nodes.get(id).cloned()
    }

    #[must_use]
    pub fn project_snapshot(&self, id: &ProjectId) -> Option<Project> {
        self.tables.read().projects.get(id).cloned()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.project_snapshot(id))
    }

    async fn node(&self, id: &NodeId) -> Result<Option<PersistedNode>> {
        Ok(self.node_snapshot(id))
    }

    async fn update_node(&self, id: &NodeId, update: NodeUpdate) -> Result<()> {
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::Persistence(format!("node {id} not stored")))?;

        if let Some(prompt) = update.prompt {
            node.prompt = prompt;
        }
        if let Some(response) = update.response {
            node.response = response;
        }
        if let Some(summary) = update.summary {
            node.summary = summary;
        }
        if let Some(status) = update.status {
            node.status = status;
        }
        if let Some(model) = update.model {
            node.model = Some(model);
        }
        if let Some(temperature) = update.temperature {
            node.temperature = Some(temperature);
        }
        if let Some(tokens) = update.tokens {
            node.tokens = Some(tokens);
        }
        if let Some(last_error) = update.last_error {
            node.last_error = Some(last_error);
        }
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn create_node_with_edges(&self, node: PersistedNode, parents: &[NodeId]) -> Result<()> {
        let mut tables = self.tables.write();

        if !tables.projects.contains_key(&node.project_id) {
            return Err(OrchestratorError::ProjectNotFound(node.project_id.to_string()));
        }
        if tables.nodes.contains_key(&node.id) {
            return Err(OrchestratorError::Persistence(format!("node {} already stored", node.id)));
        }
        if let Some(missing) = parents.iter().find(|p| !tables.nodes.contains_key(*p)) {
            return Err(OrchestratorError::Persistence(format!("parent {missing} not stored")));
        }

        let project_id = node.project_id.clone();
        let node_id = node.id.clone();
        tables.nodes.insert(node_id.clone(), node);
        tables
            .edges
            .extend(parents.iter().map(|p| (p.clone(), node_id.clone())));
        if let Some(project) = tables.projects.get_mut(&project_id) {
            project.node_count += 1;
            project.edge_count += parents.len() as u64;
        }
        tracing::debug!(node_id = %node_id, edges = parents.len(), "node persisted with edges");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_graph::Point;

    fn stored(project: &ProjectId, id: &str) -> PersistedNode {
        PersistedNode::from_node(project, &Node::new(NodeId::from(id), Point::default(), id))
    }

    #[tokio::test]
    async fn create_with_edges_is_all_or_nothing() {
        let db = InMemoryPersistence::new();
        let project = ProjectId::from("p");
        db.insert_project(Project::new("p", "demo"));
        db.upsert_node(stored(&project, "a"));

        let err = db
            .create_node_with_edges(stored(&project, "b"), &[NodeId::from("a"), NodeId::from("ghost")])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Persistence(_)));
        assert!(db.node_snapshot(&NodeId::from("b")).is_none());
        assert!(db.edges().is_empty());

        db.create_node_with_edges(stored(&project, "b"), &[NodeId::from("a")])
            .await
            .unwrap();
        let counts = db.project_snapshot(&project).unwrap();
        assert_eq!((counts.node_count, counts.edge_count), (1, 1));
    }

    #[tokio::test]
    async fn unknown_project_rejected() {
        let db = InMemoryPersistence::new();
        let err = db
            .create_node_with_edges(stored(&ProjectId::from("nope"), "x"), &[])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let db = InMemoryPersistence::new();
        let project = ProjectId::from("p");
        db.upsert_node(stored(&project, "a"));

        db.update_node(
            &NodeId::from("a"),
            NodeUpdate {
                response: Some("done".to_string()),
                status: Some(PersistedStatus::Completed),
                ..NodeUpdate::default()
            },
        )
        .await
        .unwrap();

        let node = db.node(&NodeId::from("a")).await.unwrap().unwrap();
        assert_eq!(node.response, "done");
        assert_eq!(node.status, PersistedStatus::Completed);
        assert_eq!(node.prompt, "a");
        assert!(db.update_node(&NodeId::from("zz"), NodeUpdate::default()).await.is_err());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(PersistedStatus::from(NodeStatus::Loading), PersistedStatus::Generating);
        assert_eq!(serde_json::to_string(&PersistedStatus::Completed).unwrap(), "\"completed\"");
    }
}
