//! Inbound realtime events
//!
//! Collaborators mirror node changes over the realtime channel as
//! `ws-create` / `ws-update` / `ws-delete`. Payloads arrive loosely typed and
//! are normalised here before the workspace folds them into the store.

use crate::types::{NodeId, NodeStatus, Orchestration, Point};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node fields as sent by a remote peer; absent fields are left untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNodePayload {
    pub id: NodeId,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Persisted status string (`generating`, `completed`, ...)
    #[serde(default)]
    pub status: Option<String>,
    /// `[x, y]` or `{ "x": .., "y": .. }`
    #[serde(default)]
    pub position: Option<Value>,
    #[serde(default)]
    pub parent_ids: Option<Vec<NodeId>>,
    #[serde(default)]
    pub orchestration: Option<Orchestration>,
}

impl RemoteNodePayload {
    #[must_use]
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            prompt: None,
            response: None,
            summary: None,
            status: None,
            position: None,
            parent_ids: None,
            orchestration: None,
        }
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_parents(mut self, parents: Vec<NodeId>) -> Self {
        self.parent_ids = Some(parents);
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: Value) -> Self {
        self.position = Some(position);
        self
    }
}

/// A node mutation mirrored from another observer of the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RemoteEvent {
    #[serde(rename = "ws-create")]
    Created { node: RemoteNodePayload },
    #[serde(rename = "ws-update")]
    Updated { node: RemoteNodePayload },
    #[serde(rename = "ws-delete")]
    Deleted { id: NodeId },
}

impl RemoteEvent {
    /// Id of the node the event is about
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Created { node } | Self::Updated { node } => &node.id,
            Self::Deleted { id } => id,
        }
    }
}

/// Map a persisted status string onto the local lifecycle
///
/// `generating` and `completed` only exist on the persisted side; locally they
/// read as `loading` and `idle`.
#[must_use]
pub fn normalize_status(raw: &str) -> Option<NodeStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "generating" | "loading" => Some(NodeStatus::Loading),
        "completed" | "idle" => Some(NodeStatus::Idle),
        "error" => Some(NodeStatus::Error),
        "stale" => Some(NodeStatus::Stale),
        _ => None,
    }
}

/// Accept a finite numeric pair in array or object form
#[must_use]
pub fn parse_position(value: &Value) -> Option<Point> {
    let (x, y) = match value {
        Value::Array(items) if items.len() == 2 => (items[0].as_f64()?, items[1].as_f64()?),
        Value::Object(map) => (map.get("x")?.as_f64()?, map.get("y")?.as_f64()?),
        _ => return None,
    };
    (x.is_finite() && y.is_finite()).then(|| Point::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_normalise() {
        assert_eq!(normalize_status("generating"), Some(NodeStatus::Loading));
        assert_eq!(normalize_status("COMPLETED"), Some(NodeStatus::Idle));
        assert_eq!(normalize_status("stale"), Some(NodeStatus::Stale));
        assert_eq!(normalize_status("bogus"), None);
    }

    #[test]
    fn positions_must_be_numeric_pairs() {
        assert_eq!(parse_position(&json!([1.5, 2])), Some(Point::new(1.5, 2.0)));
        assert_eq!(parse_position(&json!({"x": 3, "y": 4})), Some(Point::new(3.0, 4.0)));
        assert_eq!(parse_position(&json!([1])), None);
        assert_eq!(parse_position(&json!(["a", 2])), None);
        assert_eq!(parse_position(&json!("1,2")), None);
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let raw = json!({
            "event": "ws-update",
            "node": { "id": "n1", "status": "completed", "parentIds": ["p"] }
        });
        let event: RemoteEvent = serde_json::from_value(raw).unwrap();
        let RemoteEvent::Updated { node } = &event else {
            panic!("expected update, got {event:?}");
        };
        assert_eq!(node.parent_ids, Some(vec![NodeId::from("p")]));
        assert_eq!(event.node_id().as_str(), "n1");

        let delete: RemoteEvent = serde_json::from_value(json!({"event": "ws-delete", "id": "n2"})).unwrap();
        assert_eq!(delete, RemoteEvent::Deleted { id: NodeId::from("n2") });
    }
}
