//! Context aggregation
//!
//! Turns a node's ancestry into the linear message sequence sent to a
//! language model:
//! - a single parent is inlined ahead of the node
//! - multiple parents are each flattened into one labelled transcript message
//! - nodes render by role (source blocks, artifact previews, prompt/response turns)
//! - the target prompt always closes the sequence
//!
//! Recursion tracks the nodes on the current path, so a cycle that slipped
//! past the caller's acyclicity check is cut instead of recursing forever.

use crate::error::GraphError;
use crate::store::GraphStore;
use crate::types::{Node, NodeId, Role, SourcePayload};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Transcript label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ChatRole::System => "System",
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        }
    }
}

/// One message of model context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Builds model context from graph ancestry
#[derive(Debug, Clone, Copy)]
pub struct ContextAggregator {
    branch_label_chars: usize,
    artifact_preview_chars: usize,
}

impl ContextAggregator {
    #[inline]
    #[must_use]
    pub fn new(branch_label_chars: usize, artifact_preview_chars: usize) -> Self {
        Self {
            branch_label_chars,
            artifact_preview_chars,
        }
    }

    /// Messages for generating `target`'s response
    ///
    /// With several parents every parent contributes one labelled block, even
    /// when it renders nothing (the block is then the bare header). Within a
    /// rendering, blank prompts and empty responses produce no turn; the
    /// target prompt is always the final user turn.
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `target` is unknown.
    pub fn build(&self, store: &GraphStore, target: &NodeId) -> Result<Vec<ChatMessage>, GraphError> {
        let node = store
            .node(target)
            .ok_or_else(|| GraphError::NodeNotFound(target.clone()))?;

        let mut path = HashSet::new();
        path.insert(node.id.clone());

        let mut messages = self.ancestry(store, node, &mut path);
        messages.push(ChatMessage::user(node.prompt.clone()));
        Ok(messages)
    }

    /// Context contributed by the parents of `node`
    fn ancestry(&self, store: &GraphStore, node: &Node, path: &mut HashSet<NodeId>) -> Vec<ChatMessage> {
        let parents: Vec<&Node> = node.parent_ids.iter().filter_map(|id| store.node(id)).collect();

        match parents.as_slice() {
            [] => Vec::new(),
            [parent] => self.node_context(store, parent, path),
            many => many
                .iter()
                .enumerate()
                .map(|(index, parent)| {
                    let transcript = self
                        .node_context(store, parent, path)
                        .iter()
                        .map(|m| format!("{}: {}", m.role.label(), m.content))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    let header = format!("--- Context {} ---", self.branch_label(parent, index));
                    if transcript.is_empty() {
                        ChatMessage::user(header)
                    } else {
                        ChatMessage::user(format!("{header}\n{transcript}"))
                    }
                })
                .collect(),
        }
    }

    /// Ancestry of `node` followed by its own rendering
    fn node_context(&self, store: &GraphStore, node: &Node, path: &mut HashSet<NodeId>) -> Vec<ChatMessage> {
        if !path.insert(node.id.clone()) {
            tracing::warn!(node_id = %node.id, "cycle in ancestry, skipping revisit");
            return Vec::new();
        }
        let mut messages = self.ancestry(store, node, path);
        messages.extend(self.render(node));
        path.remove(&node.id);
        messages
    }

    fn branch_label(&self, parent: &Node, index: usize) -> String {
        let label: String = parent.prompt.trim().chars().take(self.branch_label_chars).collect();
        if label.is_empty() {
            format!("Branch {}", index + 1)
        } else {
            label
        }
    }

    /// Role-specific rendering of a single node
    fn render(&self, node: &Node) -> Vec<ChatMessage> {
        match node.role() {
            Role::Source => vec![ChatMessage::user(render_source(node))],
            Role::Artifact => {
                let text = if node.is_pinned() {
                    node.response.clone()
                } else if let Some(summary) = node.summary.as_ref().filter(|s| !s.trim().is_empty()) {
                    summary.clone()
                } else {
                    preview(&node.response, self.artifact_preview_chars)
                };
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![ChatMessage::assistant(text)]
                }
            }
            _ => {
                let mut messages = Vec::with_capacity(2);
                if !node.prompt.trim().is_empty() {
                    messages.push(ChatMessage::user(node.prompt.clone()));
                }
                if !node.response.trim().is_empty() {
                    messages.push(ChatMessage::assistant(node.response.clone()));
                }
                messages
            }
        }
    }
}

impl Default for ContextAggregator {
    fn default() -> Self {
        Self::new(30, 600)
    }
}

fn render_source(node: &Node) -> String {
    let fallback = SourcePayload::default();
    let source = node.orchestration.source.as_ref().unwrap_or(&fallback);
    let title = if source.title.is_empty() { node.prompt.as_str() } else { source.title.as_str() };

    let mut block = format!("[Source] {title}");
    if !source.kind.is_empty() {
        let _ = write!(block, "\nKind: {}", source.kind);
    }
    if let Some(uri) = &source.uri {
        let _ = write!(block, "\nURI: {uri}");
    }
    if !source.excerpts.is_empty() {
        block.push_str("\nExcerpts:");
        for excerpt in &source.excerpts {
            match (excerpt.start_line, excerpt.end_line) {
                (Some(start), Some(end)) => {
                    let _ = write!(block, "\n- (lines {start}-{end}) {}", excerpt.text);
                }
                (Some(start), None) => {
                    let _ = write!(block, "\n- (line {start}) {}", excerpt.text);
                }
                _ => {
                    let _ = write!(block, "\n- {}", excerpt.text);
                }
            }
        }
    }
    let summary = source.summary.as_ref().or(node.summary.as_ref());
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        let _ = write!(block, "\nSummary: {summary}");
    }
    block
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodePatch;
    use crate::types::{Orchestration, Point, SourceExcerpt};
    use pretty_assertions::assert_eq;

    fn node(store: &mut GraphStore, prompt: &str, response: &str) -> NodeId {
        let id = store.add_node_with_prompt(Point::default(), prompt);
        store.update_node(&id, NodePatch::new().response(response));
        id
    }

    #[test]
    fn linear_chain_inlines_ancestry() {
        let mut store = GraphStore::new();
        let a = node(&mut store, "Q1", "A1");
        let b = node(&mut store, "Q2", "A2");
        let c = node(&mut store, "Q3", "");
        store.add_edge(&a, &b);
        store.add_edge(&b, &c);

        let messages = ContextAggregator::default().build(&store, &c).unwrap();
        assert_eq!(
            messages,
            vec![
                ChatMessage::user("Q1"),
                ChatMessage::assistant("A1"),
                ChatMessage::user("Q2"),
                ChatMessage::assistant("A2"),
                ChatMessage::user("Q3"),
            ]
        );
    }

    #[test]
    fn multiple_parents_become_labelled_transcripts() {
        let mut store = GraphStore::new();
        let left = node(&mut store, "Left branch question", "L");
        let right = node(&mut store, "", "R");
        let merge = node(&mut store, "Merge", "");
        store.add_edge(&left, &merge);
        store.add_edge(&right, &merge);

        let messages = ContextAggregator::default().build(&store, &merge).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0].content,
            "--- Context Left branch question ---\nUser: Left branch question\n\nAssistant: L"
        );
        assert_eq!(messages[1].content, "--- Context Branch 2 ---\nAssistant: R");
        assert_eq!(messages[2], ChatMessage::user("Merge"));
    }

    #[test]
    fn every_parent_gets_a_block() {
        let mut store = GraphStore::new();
        let first = node(&mut store, "First", "one");
        let blank = node(&mut store, "  ", "");
        let third = node(&mut store, "Third", "");
        let merge = node(&mut store, "Merge", "");
        for parent in [&first, &blank, &third] {
            store.add_edge(parent, &merge);
        }

        let messages = ContextAggregator::default().build(&store, &merge).unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "--- Context First ---\nUser: First\n\nAssistant: one",
                "--- Context Branch 2 ---",
                "--- Context Third ---\nUser: Third",
                "Merge",
            ]
        );
    }

    #[test]
    fn branch_label_truncates_to_thirty_chars() {
        let mut store = GraphStore::new();
        let long = "x".repeat(45);
        let p1 = node(&mut store, &long, "");
        let p2 = node(&mut store, "short", "");
        let t = node(&mut store, "t", "");
        store.add_edge(&p1, &t);
        store.add_edge(&p2, &t);

        let messages = ContextAggregator::default().build(&store, &t).unwrap();
        assert!(messages[0].content.starts_with(&format!("--- Context {} ---", "x".repeat(30))));
    }

    #[test]
    fn source_renders_structured_block_with_summary_fallback() {
        let mut store = GraphStore::new();
        let src = node(&mut store, "spec.pdf", "");
        let payload = SourcePayload {
            title: "Spec".to_string(),
            kind: "pdf".to_string(),
            uri: Some("file://spec.pdf".to_string()),
            excerpts: vec![SourceExcerpt::new("must be fast").with_lines(3, 4)],
            summary: None,
        };
        store.update_node(
            &src,
            NodePatch::new()
                .orchestration(Orchestration::with_role(Role::Source).with_source(payload))
                .summary(Some("Perf spec".to_string())),
        );
        let t = node(&mut store, "go", "");
        store.add_edge(&src, &t);

        let messages = ContextAggregator::default().build(&store, &t).unwrap();
        assert_eq!(
            messages[0].content,
            "[Source] Spec\nKind: pdf\nURI: file://spec.pdf\nExcerpts:\n- (lines 3-4) must be fast\nSummary: Perf spec"
        );
    }

    #[test]
    fn artifact_prefers_pinned_then_summary_then_preview() {
        let mut store = GraphStore::new();
        let long = "y".repeat(700);
        let art = node(&mut store, "artifact", &long);
        store.update_node(&art, NodePatch::new().orchestration(Orchestration::with_role(Role::Artifact)));
        let t = node(&mut store, "next", "");
        store.add_edge(&art, &t);
        let agg = ContextAggregator::default();

        let preview_msg = agg.build(&store, &t).unwrap();
        assert_eq!(preview_msg[0].content.len(), 603);

        store.update_node(&art, NodePatch::new().summary(Some("short".to_string())));
        assert_eq!(agg.build(&store, &t).unwrap()[0].content, "short");

        store.update_node(&art, NodePatch::new().orchestration(Orchestration::with_role(Role::Artifact).pinned()));
        assert_eq!(agg.build(&store, &t).unwrap()[0].content, long);
    }

    #[test]
    fn cycle_in_ancestry_terminates() {
        let mut store = GraphStore::new();
        let a = node(&mut store, "A", "");
        let b = node(&mut store, "B", "");
        store.add_edge(&a, &b);
        store.add_edge(&b, &a);

        let messages = ContextAggregator::default().build(&store, &b).unwrap();
        assert_eq!(messages, vec![ChatMessage::user("A"), ChatMessage::user("B")]);
    }

    #[test]
    fn unknown_target_is_not_found() {
        let store = GraphStore::new();
        let err = ContextAggregator::default().build(&store, &NodeId::from("x")).unwrap_err();
        assert!(err.is_not_found());
    }
}
