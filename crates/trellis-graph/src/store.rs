//! Graph store
//!
//! Owns the node and edge mappings and keeps them consistent:
//! - every edge (s, t) is mirrored in `t.parent_ids` and `s.children_ids`
//! - no two edges share a (source, target) pair
//! - deleting a node removes every incident edge and link entry
//!
//! Acyclicity is the caller's job (see [`GraphStore::is_reachable`]); the store
//! does not re-verify it on `add_edge`.

use crate::error::GraphError;
use crate::heuristics::derive_mode;
use crate::history::HistorySnapshot;
use crate::types::{Edge, EdgeId, Node, NodeId, NodeStatus, Orchestration, Point, Role};
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Shallow field update for [`GraphStore::update_node`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub prompt: Option<String>,
    pub response: Option<String>,
    /// `Some(None)` clears the summary
    pub summary: Option<Option<String>>,
    pub status: Option<NodeStatus>,
    pub position: Option<Point>,
    pub orchestration: Option<Orchestration>,
}

impl NodePatch {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    #[inline]
    #[must_use]
    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[inline]
    #[must_use]
    pub fn position(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }

    #[inline]
    #[must_use]
    pub fn orchestration(mut self, orchestration: Orchestration) -> Self {
        self.orchestration = Some(orchestration);
        self
    }

    /// True when the patch would change nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// In-memory node/edge container
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: IndexMap<NodeId, Node>,
    edges: IndexMap<EdgeId, Edge>,
    selected: BTreeSet<NodeId>,
    project_name: String,
    child_offset: Point,
}

impl GraphStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset applied to children created with `create_child_position`
    #[inline]
    #[must_use]
    pub fn with_child_offset(mut self, offset: Point) -> Self {
        self.child_offset = offset;
        self
    }

    // ---- reads -----------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Edges in insertion order
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    #[inline]
    #[must_use]
    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Edge between a (source, target) pair
    #[must_use]
    pub fn find_edge(&self, source: &NodeId, target: &NodeId) -> Option<&Edge> {
        self.edges
            .values()
            .find(|e| &e.source == source && &e.target == target)
    }

    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    #[must_use]
    pub fn selected(&self) -> &BTreeSet<NodeId> {
        &self.selected
    }

    #[inline]
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Where a new child of `parent` should be drawn
    #[must_use]
    pub fn child_position(&self, parent: &NodeId) -> Point {
        self.nodes
            .get(parent)
            .map(|p| p.position.offset(self.child_offset))
            .unwrap_or_default()
    }

    // ---- node mutations --------------------------------------------------

    /// Create an isolated node with an empty prompt
    pub fn add_node(&mut self, position: Point) -> NodeId {
        self.add_node_with_prompt(position, "")
    }

    /// Create an isolated node
    pub fn add_node_with_prompt(&mut self, position: Point, prompt: impl Into<String>) -> NodeId {
        let id = NodeId::generate();
        self.insert_node(Node::new(id.clone(), position, prompt));
        id
    }

    /// Insert a fully built node under its own id
    ///
    /// Link arrays are cleared; links are only ever created through `add_edge`.
    /// Returns `false` if the id is already taken.
    pub fn insert_node(&mut self, mut node: Node) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        node.parent_ids.clear();
        node.children_ids.clear();
        tracing::debug!(node_id = %node.id, "node added");
        self.nodes.insert(node.id.clone(), node);
        true
    }

    /// Shallow-merge fields and refresh `updated_at`; no-op for unknown ids
    pub fn update_node(&mut self, id: &NodeId, patch: NodePatch) -> bool {
        self.modify_node(id, |node| {
            if let Some(prompt) = patch.prompt {
                node.prompt = prompt;
            }
            if let Some(response) = patch.response {
                node.response = response;
            }
            if let Some(summary) = patch.summary {
                node.summary = summary;
            }
            if let Some(status) = patch.status {
                node.status = status;
            }
            if let Some(position) = patch.position {
                node.position = position;
            }
            if let Some(orchestration) = patch.orchestration {
                node.orchestration = orchestration;
            }
        })
    }

    /// Apply `f` to a node and refresh its timestamp
    pub(crate) fn modify_node(&mut self, id: &NodeId, f: impl FnOnce(&mut Node)) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                f(node);
                node.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a node, its link entries on neighbours and every incident edge
    pub fn delete_node(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        let parents = node.parent_ids.clone();
        let children = node.children_ids.clone();

        for parent in &parents {
            self.modify_node(parent, |p| p.children_ids.retain(|c| c != id));
        }
        for child in &children {
            self.modify_node(child, |c| c.parent_ids.retain(|p| p != id));
        }

        let before = self.edges.len();
        self.edges.retain(|_, e| &e.source != id && &e.target != id);
        self.selected.remove(id);
        self.nodes.shift_remove(id);

        tracing::debug!(
            node_id = %id,
            edges_removed = before - self.edges.len(),
            "node deleted"
        );
        true
    }

    /// Set status; a stale plan also marks its plan payload stale
    pub fn set_node_status(&mut self, id: &NodeId, status: NodeStatus) -> bool {
        self.modify_node(id, |node| apply_status(node, status))
    }

    /// Replace the prompt, re-derive the mode and cascade staleness
    ///
    /// Returns `false` for unknown ids and unchanged text.
    pub fn update_node_prompt(&mut self, id: &NodeId, prompt: impl Into<String>) -> bool {
        let prompt = prompt.into();
        match self.nodes.get(id) {
            Some(node) if node.prompt != prompt => {}
            _ => return false,
        }

        self.modify_node(id, |node| {
            if !node.orchestration.mode_pinned {
                node.orchestration.mode = Some(derive_mode(&prompt));
            }
            node.prompt = prompt;
        });

        let stale = self.mark_descendants_stale(id);
        tracing::debug!(node_id = %id, stale = stale.len(), "prompt updated");
        true
    }

    pub fn update_node_response(&mut self, id: &NodeId, response: impl Into<String>) -> bool {
        let response = response.into();
        self.modify_node(id, |node| node.response = response)
    }

    pub fn update_node_summary(&mut self, id: &NodeId, summary: impl Into<String>) -> bool {
        let summary = summary.into();
        self.modify_node(id, |node| node.summary = Some(summary))
    }

    // ---- edges -----------------------------------------------------------

    /// Link `source -> target`
    ///
    /// Returns `None` without mutating when the pair is already linked, either
    /// endpoint is unknown, or source equals target.
    pub fn add_edge(&mut self, source: &NodeId, target: &NodeId) -> Option<EdgeId> {
        if source == target || !self.contains(source) || !self.contains(target) {
            return None;
        }
        if self.find_edge(source, target).is_some() {
            return None;
        }

        let edge = Edge {
            id: EdgeId::generate(),
            source: source.clone(),
            target: target.clone(),
            created_at: Utc::now(),
        };
        let id = edge.id.clone();

        self.modify_node(source, |s| {
            if !s.children_ids.contains(target) {
                s.children_ids.push(target.clone());
            }
        });
        self.modify_node(target, |t| {
            if !t.parent_ids.contains(source) {
                t.parent_ids.push(source.clone());
            }
        });
        self.edges.insert(id.clone(), edge);

        tracing::debug!(edge_id = %id, %source, %target, "edge added");
        Some(id)
    }

    /// Unlink both endpoints and drop the edge; no-op for unknown ids
    pub fn delete_edge(&mut self, id: &EdgeId) -> bool {
        let Some(edge) = self.edges.shift_remove(id) else {
            return false;
        };
        self.modify_node(&edge.source, |s| s.children_ids.retain(|c| c != &edge.target));
        self.modify_node(&edge.target, |t| t.parent_ids.retain(|p| p != &edge.source));
        tracing::debug!(edge_id = %id, "edge deleted");
        true
    }

    // ---- traversal -------------------------------------------------------

    /// Breadth-first descendants of `root`, excluding `root`, each id once
    #[must_use]
    pub fn descendants(&self, root: &NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut queue: VecDeque<&NodeId> = VecDeque::new();

        if let Some(node) = self.nodes.get(root) {
            seen.insert(&node.id);
            queue.extend(node.children_ids.iter());
        }

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            order.push(id.clone());
            queue.extend(node.children_ids.iter());
        }
        order
    }

    /// Whether `to` can be reached from `from` by following child links
    #[must_use]
    pub fn is_reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        from == to || self.descendants(from).iter().any(|id| id == to)
    }

    /// Staleness cascade: mark every non-generating descendant stale
    ///
    /// Returns the ids that were marked, in breadth-first order.
    pub fn mark_descendants_stale(&mut self, root: &NodeId) -> Vec<NodeId> {
        let mut marked = Vec::new();
        for id in self.descendants(root) {
            let generating = self.nodes.get(&id).is_some_and(|n| n.status.is_generating());
            if generating {
                continue;
            }
            self.set_node_status(&id, NodeStatus::Stale);
            marked.push(id);
        }
        marked
    }

    // ---- selection / project -----------------------------------------------

    pub fn select(&mut self, id: &NodeId) -> bool {
        self.contains(id) && self.selected.insert(id.clone())
    }

    pub fn deselect(&mut self, id: &NodeId) -> bool {
        self.selected.remove(id)
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    pub fn set_project_name(&mut self, name: impl Into<String>) {
        self.project_name = name.into();
    }

    // ---- snapshots -------------------------------------------------------

    /// Deep copy of the versioned state
    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            selected: self.selected.clone(),
            project_name: self.project_name.clone(),
        }
    }

    /// Replace the versioned state with a snapshot
    pub fn restore(&mut self, snapshot: HistorySnapshot) {
        self.nodes = snapshot.nodes;
        self.edges = snapshot.edges;
        self.selected = snapshot.selected;
        self.project_name = snapshot.project_name;
    }

    // ---- validation ------------------------------------------------------

    /// Verify link symmetry, dangling ids and edge uniqueness
    ///
    /// # Errors
    /// `GraphError::InvariantViolation` describing the first problem found.
    pub fn check_invariants(&self) -> Result<(), GraphError> {
        let violation = |msg: String| Err(GraphError::InvariantViolation(msg));

        let mut pairs = HashSet::new();
        for edge in self.edges.values() {
            if !pairs.insert((&edge.source, &edge.target)) {
                return violation(format!("duplicate edge {} -> {}", edge.source, edge.target));
            }
            let (Some(source), Some(target)) = (self.nodes.get(&edge.source), self.nodes.get(&edge.target))
            else {
                return violation(format!("edge {} has a missing endpoint", edge.id));
            };
            if !source.children_ids.contains(&edge.target) {
                return violation(format!("{} missing child {}", edge.source, edge.target));
            }
            if !target.parent_ids.contains(&edge.source) {
                return violation(format!("{} missing parent {}", edge.target, edge.source));
            }
        }

        for node in self.nodes.values() {
            let unique_parents: HashSet<_> = node.parent_ids.iter().collect();
            let unique_children: HashSet<_> = node.children_ids.iter().collect();
            if unique_parents.len() != node.parent_ids.len()
                || unique_children.len() != node.children_ids.len()
            {
                return violation(format!("duplicate link entry on {}", node.id));
            }
            for parent in &node.parent_ids {
                if !pairs.contains(&(parent, &node.id)) {
                    return violation(format!("{} lists parent {} without an edge", node.id, parent));
                }
            }
            for child in &node.children_ids {
                if !pairs.contains(&(&node.id, child)) {
                    return violation(format!("{} lists child {} without an edge", node.id, child));
                }
            }
        }

        for id in &self.selected {
            if !self.nodes.contains_key(id) {
                return violation(format!("selected node {id} does not exist"));
            }
        }
        Ok(())
    }
}

/// Status write shared by `set_node_status` and bulk updates
pub(crate) fn apply_status(node: &mut Node, status: NodeStatus) {
    node.status = status;
    if status == NodeStatus::Stale && node.orchestration.role == Role::Plan {
        if let Some(plan) = node.orchestration.plan.as_mut() {
            plan.is_stale = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanPayload, Mode};
    use pretty_assertions::assert_eq;

    fn chain(store: &mut GraphStore, prompts: &[&str]) -> Vec<NodeId> {
        let ids: Vec<NodeId> = prompts
            .iter()
            .map(|p| store.add_node_with_prompt(Point::default(), *p))
            .collect();
        for pair in ids.windows(2) {
            store.add_edge(&pair[0], &pair[1]).unwrap();
        }
        ids
    }

    #[test]
    fn add_edge_links_both_endpoints() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, &["a", "b"]);

        assert_eq!(store.node(&ids[0]).unwrap().children_ids, vec![ids[1].clone()]);
        assert_eq!(store.node(&ids[1]).unwrap().parent_ids, vec![ids[0].clone()]);
        assert_eq!(store.edge_count(), 1);
        store.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_edge_returns_none() {
        let mut store = GraphStore::new();
        let a = store.add_node(Point::default());
        let b = store.add_node(Point::default());

        assert!(store.add_edge(&a, &b).is_some());
        assert!(store.add_edge(&a, &b).is_none());
        assert_eq!(store.edge_count(), 1);
        assert_eq!(store.node(&b).unwrap().parent_ids.len(), 1);
        assert_eq!(store.node(&a).unwrap().children_ids.len(), 1);
    }

    #[test]
    fn add_edge_rejects_unknown_endpoints_and_self_loops() {
        let mut store = GraphStore::new();
        let a = store.add_node(Point::default());
        assert!(store.add_edge(&a, &a).is_none());
        assert!(store.add_edge(&a, &NodeId::from("ghost")).is_none());
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn delete_node_repairs_neighbours() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, &["p", "x", "y"]);
        store.select(&ids[1]);

        assert!(store.delete_node(&ids[1]));

        assert!(store.node(&ids[0]).unwrap().children_ids.is_empty());
        assert!(store.node(&ids[2]).unwrap().parent_ids.is_empty());
        assert_eq!(store.edge_count(), 0);
        assert!(store.selected().is_empty());
        store.check_invariants().unwrap();
    }

    #[test]
    fn delete_unknown_is_noop() {
        let mut store = GraphStore::new();
        assert!(!store.delete_node(&NodeId::from("nope")));
        assert!(!store.delete_edge(&EdgeId("nope".to_string())));
    }

    #[test]
    fn delete_edge_unlinks() {
        let mut store = GraphStore::new();
        let a = store.add_node(Point::default());
        let b = store.add_node(Point::default());
        let edge = store.add_edge(&a, &b).unwrap();

        assert!(store.delete_edge(&edge));
        assert!(store.node(&a).unwrap().children_ids.is_empty());
        assert!(store.node(&b).unwrap().parent_ids.is_empty());
    }

    #[test]
    fn prompt_update_cascades_but_protects_loading_nodes() {
        let mut store = GraphStore::new();
        let r = store.add_node_with_prompt(Point::default(), "root");
        let c1 = store.add_node_with_prompt(Point::default(), "c1");
        let c2 = store.add_node_with_prompt(Point::default(), "c2");
        let g = store.add_node_with_prompt(Point::default(), "g");
        store.add_edge(&r, &c1);
        store.add_edge(&r, &c2);
        store.add_edge(&c1, &g);
        store.set_node_status(&c1, NodeStatus::Loading);

        assert!(store.update_node_prompt(&r, "new"));

        assert_eq!(store.node(&c1).unwrap().status, NodeStatus::Loading);
        assert_eq!(store.node(&c2).unwrap().status, NodeStatus::Stale);
        assert_eq!(store.node(&g).unwrap().status, NodeStatus::Stale);
        assert_eq!(store.node(&r).unwrap().status, NodeStatus::Idle);
    }

    #[test]
    fn unchanged_prompt_is_noop() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, &["same", "child"]);
        assert!(!store.update_node_prompt(&ids[0], "same"));
        assert_eq!(store.node(&ids[1]).unwrap().status, NodeStatus::Idle);
    }

    #[test]
    fn prompt_update_derives_mode_unless_pinned() {
        let mut store = GraphStore::new();
        let a = store.add_node_with_prompt(Point::default(), "");
        store.update_node_prompt(&a, "plan the release");
        assert_eq!(store.node(&a).unwrap().orchestration.mode, Some(Mode::Build));

        let b = store.add_node_with_prompt(Point::default(), "");
        let pinned = Orchestration::default().with_mode(Mode::Explore);
        store.update_node(&b, NodePatch::new().orchestration(pinned));
        store.update_node_prompt(&b, "implement it");
        assert_eq!(store.node(&b).unwrap().orchestration.mode, Some(Mode::Explore));
    }

    #[test]
    fn stale_plan_marks_payload() {
        let mut store = GraphStore::new();
        let plan = store.add_node_with_prompt(Point::default(), "plan");
        let mut meta = Orchestration::with_role(Role::Plan);
        meta.plan = Some(PlanPayload {
            build_root_id: plan.clone(),
            deliverable: "d".to_string(),
            versions: Vec::new(),
            active_version: 1,
            is_stale: false,
        });
        store.update_node(&plan, NodePatch::new().orchestration(meta));

        store.set_node_status(&plan, NodeStatus::Stale);

        let node = store.node(&plan).unwrap();
        assert!(node.orchestration.plan.as_ref().unwrap().is_stale);
    }

    #[test]
    fn descendants_visit_diamond_once() {
        let mut store = GraphStore::new();
        let ids = chain(&mut store, &["a", "b", "d"]);
        let c = store.add_node_with_prompt(Point::default(), "c");
        store.add_edge(&ids[0], &c);
        store.add_edge(&c, &ids[2]);

        let desc = store.descendants(&ids[0]);
        assert_eq!(desc.len(), 3);
        assert!(store.is_reachable(&ids[0], &ids[2]));
        assert!(!store.is_reachable(&ids[2], &ids[0]));
    }

    #[test]
    fn update_node_refreshes_timestamp() {
        let mut store = GraphStore::new();
        let a = store.add_node(Point::default());
        let before = store.node(&a).unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.update_node(&a, NodePatch::new().response("hi"));
        let node = store.node(&a).unwrap();
        assert_eq!(node.response, "hi");
        assert!(node.updated_at > before);
    }

    #[test]
    fn snapshot_round_trip_restores_state() {
        let mut store = GraphStore::new();
        chain(&mut store, &["a", "b"]);
        let snap = store.snapshot();
        store.add_node(Point::default());
        store.restore(snap.clone());
        assert_eq!(store.snapshot(), snap);
    }
}
