//! Realtime broadcast seam

use crate::persistence::ProjectId;
use crate::stream::StreamFrame;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use trellis_graph::NodeId;

/// Event name for mirrored generation progress
pub const NODE_STREAMING: &str = "node:streaming";

/// Fan-out to other observers of a project
#[async_trait]
pub trait Broadcaster: Send + Sync + Debug {
    async fn emit_to_project(&self, project: &ProjectId, event: &str, payload: Value);
}

/// Broadcaster for single-observer setups
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn emit_to_project(&self, _project: &ProjectId, _event: &str, _payload: Value) {}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingPayload<'a> {
    node_id: &'a NodeId,
    #[serde(flatten)]
    frame: &'a StreamFrame,
}

/// `node:streaming` payload: the frame plus the node it belongs to
#[must_use]
pub fn streaming_payload(node_id: &NodeId, frame: &StreamFrame) -> Value {
    serde_json::to_value(StreamingPayload { node_id, frame }).unwrap_or(Value::Null)
}
