//! Core types for the prompt graph
//!
//! Defines the fundamental graph vocabulary:
//! - Node and edge identifiers
//! - Nodes, their status and orchestration metadata
//! - Role-specific payloads (sources, artifacts, plans)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque node identifier (caller supplied or generated)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a new random node ID
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique edge identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    /// Generate a new random edge ID
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canvas position (presentation only)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Translate by an offset
    #[inline]
    #[must_use]
    pub fn offset(self, by: Point) -> Self {
        Self::new(self.x + by.x, self.y + by.y)
    }
}

/// Node lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Nothing pending
    #[default]
    Idle,
    /// A generation is streaming into this node
    Loading,
    /// Last generation failed
    Error,
    /// An ancestor changed since the response was produced
    Stale,
}

impl NodeStatus {
    /// Whether a generation currently owns the node
    #[inline]
    #[must_use]
    pub fn is_generating(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

/// Logical role, drives how a node is rendered into context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Conversation,
    Source,
    Artifact,
    Challenger,
    Plan,
    Todo,
}

/// Working mode derived from prompt wording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Explore,
    Build,
}

/// Excerpt quoted from a source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceExcerpt {
    pub text: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

impl SourceExcerpt {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            start_line: None,
            end_line: None,
        }
    }

    #[must_use]
    pub fn with_lines(mut self, start: u32, end: u32) -> Self {
        self.start_line = Some(start);
        self.end_line = Some(end);
        self
    }
}

/// Payload carried by `source` nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePayload {
    pub title: String,
    pub kind: String,
    pub uri: Option<String>,
    pub excerpts: Vec<SourceExcerpt>,
    pub summary: Option<String>,
}

/// What an artifact node was derived as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Deliverable,
    Todo,
}

/// Single todo entry parsed from a generated todo list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub done: bool,
}

/// Payload carried by `artifact` nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPayload {
    pub kind: ArtifactKind,
    pub plan_id: Option<NodeId>,
    pub plan_version: Option<u32>,
    #[serde(default)]
    pub todo_items: Vec<TodoItem>,
}

/// One generated revision of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanVersion {
    pub version: u32,
    pub content: String,
    /// Sorted, pipe-joined ids of the nodes that backed this version
    pub scope_fingerprint: String,
    pub included_node_ids: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

/// Payload carried by `plan` nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPayload {
    pub build_root_id: NodeId,
    pub deliverable: String,
    pub versions: Vec<PlanVersion>,
    pub active_version: u32,
    pub is_stale: bool,
}

impl PlanPayload {
    /// Currently displayed version
    #[must_use]
    pub fn active(&self) -> Option<&PlanVersion> {
        self.version(self.active_version)
    }

    #[must_use]
    pub fn version(&self, version: u32) -> Option<&PlanVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn version_mut(&mut self, version: u32) -> Option<&mut PlanVersion> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    /// Highest stored version number (0 when none)
    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.versions.iter().map(|v| v.version).max().unwrap_or(0)
    }
}

/// Bookkeeping from the last generation run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationMeta {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub tokens: Option<u32>,
    pub last_error: Option<String>,
}

/// Orchestration metadata bag attached to every node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Orchestration {
    pub role: Role,
    pub pinned: bool,
    pub mode: Option<Mode>,
    /// Mode was chosen by hand and must not be re-derived
    pub mode_pinned: bool,
    pub source: Option<SourcePayload>,
    pub artifact: Option<ArtifactPayload>,
    pub plan: Option<PlanPayload>,
    pub generation: GenerationMeta,
}

impl Orchestration {
    /// Metadata for a given role
    #[inline]
    #[must_use]
    pub fn with_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_source(mut self, source: SourcePayload) -> Self {
        self.source = Some(source);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self.mode_pinned = true;
        self
    }
}

/// A prompt/response node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub prompt: String,
    pub response: String,
    pub summary: Option<String>,
    pub status: NodeStatus,
    pub position: Point,
    pub parent_ids: Vec<NodeId>,
    pub children_ids: Vec<NodeId>,
    pub orchestration: Orchestration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create an isolated idle node
    #[must_use]
    pub fn new(id: NodeId, position: Point, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            prompt: prompt.into(),
            response: String::new(),
            summary: None,
            status: NodeStatus::Idle,
            position,
            parent_ids: Vec::new(),
            children_ids: Vec::new(),
            orchestration: Orchestration::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.orchestration.role
    }

    #[inline]
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.orchestration.pinned
    }

    /// Refresh `updated_at`
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Directed parent -> child link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_starts_isolated_and_idle() {
        let node = Node::new(NodeId::from("n1"), Point::new(1.0, 2.0), "hello");
        assert_eq!(node.status, NodeStatus::Idle);
        assert!(node.parent_ids.is_empty());
        assert!(node.children_ids.is_empty());
        assert_eq!(node.role(), Role::Conversation);
    }

    #[test]
    fn plan_payload_version_lookup() {
        let plan = PlanPayload {
            build_root_id: NodeId::from("r"),
            deliverable: "doc".to_string(),
            versions: vec![
                PlanVersion {
                    version: 1,
                    content: "one".to_string(),
                    scope_fingerprint: "r".to_string(),
                    included_node_ids: vec![NodeId::from("r")],
                    created_at: Utc::now(),
                },
                PlanVersion {
                    version: 3,
                    content: "three".to_string(),
                    scope_fingerprint: "r".to_string(),
                    included_node_ids: vec![NodeId::from("r")],
                    created_at: Utc::now(),
                },
            ],
            active_version: 3,
            is_stale: false,
        };

        assert_eq!(plan.latest_version(), 3);
        assert_eq!(plan.active().map(|v| v.content.as_str()), Some("three"));
        assert!(plan.version(2).is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&NodeStatus::Stale).unwrap();
        assert_eq!(json, "\"stale\"");
    }
}
