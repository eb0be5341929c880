//! Build sessions
//!
//! A build session curates a scored sub-graph around a pivot node into an
//! inclusion set. The session keeps:
//! - the scorer's untouched recommendation (`suggested_*`) as a reset target
//! - the user's curation (`included` / `excluded` / `pinned`)
//! - impact flags raised when the graph changes underneath it
//!
//! Included and excluded are mutually exclusive at all times.

use crate::config::BuildConfig;
use crate::error::GraphError;
use crate::heuristics::is_critical;
use crate::scope::{compute_scope, include_by_default, Direction, ScopeEntry, ScopeScorer};
use crate::store::GraphStore;
use crate::types::{Node, NodeId};
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// Live curation state (at most one per workspace)
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSession {
    root_node_id: NodeId,
    target_plan_id: Option<NodeId>,
    deliverable: String,
    direction: Direction,
    max_depth: u32,
    scope: IndexMap<NodeId, ScopeEntry>,
    included: BTreeSet<NodeId>,
    excluded: BTreeSet<NodeId>,
    pinned: BTreeSet<NodeId>,
    suggested_included: BTreeSet<NodeId>,
    suggested_excluded: BTreeSet<NodeId>,
    frozen: bool,
    impact_global_detected: bool,
    impacted_branch_ids: BTreeSet<NodeId>,
}

impl BuildSession {
    /// Open a session around `root` seeded from the scorer's suggestion
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `root` is unknown.
    pub fn start(
        store: &GraphStore,
        root: &NodeId,
        config: BuildConfig,
        scorer: &dyn ScopeScorer,
    ) -> Result<Self, GraphError> {
        if !store.contains(root) {
            return Err(GraphError::NodeNotFound(root.clone()));
        }
        let mut session = Self {
            root_node_id: root.clone(),
            target_plan_id: None,
            deliverable: String::new(),
            direction: config.direction,
            max_depth: config.max_depth,
            scope: IndexMap::new(),
            included: BTreeSet::new(),
            excluded: BTreeSet::new(),
            pinned: BTreeSet::new(),
            suggested_included: BTreeSet::new(),
            suggested_excluded: BTreeSet::new(),
            frozen: false,
            impact_global_detected: false,
            impacted_branch_ids: BTreeSet::new(),
        };
        session.recompute_all(store, scorer);
        Ok(session)
    }

    /// Open a session that edits the scope of an existing plan
    ///
    /// The scope is re-derived around the plan's recorded build root, but the
    /// included set starts from the plan's current parents plus the root.
    ///
    /// # Errors
    /// - `GraphError::NodeNotFound` for an unknown plan or build root
    /// - `GraphError::NotAPlan` if the node carries no plan payload
    pub fn for_plan(
        store: &GraphStore,
        plan_id: &NodeId,
        config: BuildConfig,
        scorer: &dyn ScopeScorer,
    ) -> Result<Self, GraphError> {
        let plan_node = store
            .node(plan_id)
            .ok_or_else(|| GraphError::NodeNotFound(plan_id.clone()))?;
        let plan = plan_node
            .orchestration
            .plan
            .as_ref()
            .ok_or_else(|| GraphError::NotAPlan(plan_id.clone()))?;

        let mut session = Self::start(store, &plan.build_root_id, config, scorer)?;
        session.target_plan_id = Some(plan_id.clone());
        session.deliverable = plan.deliverable.clone();

        // A plan can never feed itself or anything downstream of it
        let downstream: BTreeSet<NodeId> = store.descendants(plan_id).into_iter().collect();
        session
            .scope
            .retain(|id, _| id != plan_id && !downstream.contains(id));
        session.refresh_suggestions(store);

        session.included = plan_node
            .parent_ids
            .iter()
            .filter(|id| store.contains(id))
            .cloned()
            .collect();
        session.included.insert(session.root_node_id.clone());
        session.excluded = session
            .suggested_excluded
            .difference(&session.included)
            .cloned()
            .collect();
        Ok(session)
    }

    // ---- accessors -------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn root_node_id(&self) -> &NodeId {
        &self.root_node_id
    }

    #[inline]
    #[must_use]
    pub fn target_plan_id(&self) -> Option<&NodeId> {
        self.target_plan_id.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn deliverable(&self) -> &str {
        &self.deliverable
    }

    #[inline]
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[inline]
    #[must_use]
    pub fn scope(&self) -> &IndexMap<NodeId, ScopeEntry> {
        &self.scope
    }

    #[inline]
    #[must_use]
    pub fn included(&self) -> &BTreeSet<NodeId> {
        &self.included
    }

    #[inline]
    #[must_use]
    pub fn excluded(&self) -> &BTreeSet<NodeId> {
        &self.excluded
    }

    #[inline]
    #[must_use]
    pub fn pinned(&self) -> &BTreeSet<NodeId> {
        &self.pinned
    }

    #[inline]
    #[must_use]
    pub fn suggested_included(&self) -> &BTreeSet<NodeId> {
        &self.suggested_included
    }

    #[inline]
    #[must_use]
    pub fn suggested_excluded(&self) -> &BTreeSet<NodeId> {
        &self.suggested_excluded
    }

    #[inline]
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[inline]
    #[must_use]
    pub fn impact_global_detected(&self) -> bool {
        self.impact_global_detected
    }

    #[inline]
    #[must_use]
    pub fn impacted_branch_ids(&self) -> &BTreeSet<NodeId> {
        &self.impacted_branch_ids
    }

    /// Included set with the root forced in
    #[must_use]
    pub fn effective_included(&self) -> BTreeSet<NodeId> {
        let mut ids = self.included.clone();
        ids.insert(self.root_node_id.clone());
        ids
    }

    // ---- configuration -----------------------------------------------------

    pub fn set_deliverable(&mut self, text: impl Into<String>) {
        self.deliverable = text.into();
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    /// Change traversal shape; manual curation is discarded
    pub fn set_config(
        &mut self,
        store: &GraphStore,
        scorer: &dyn ScopeScorer,
        direction: Option<Direction>,
        max_depth: Option<u32>,
    ) {
        if let Some(direction) = direction {
            self.direction = direction;
        }
        if let Some(max_depth) = max_depth {
            self.max_depth = max_depth;
        }
        self.recompute_all(store, scorer);
    }

    /// Refresh the scope globally (`None`) or for a single branch
    pub fn recompute(&mut self, store: &GraphStore, scorer: &dyn ScopeScorer, branch: Option<&NodeId>) {
        match branch {
            None => self.recompute_all(store, scorer),
            Some(branch) => self.recompute_branch(store, scorer, branch),
        }
    }

    fn fresh_scope(&self, store: &GraphStore, scorer: &dyn ScopeScorer) -> IndexMap<NodeId, ScopeEntry> {
        let mut scope = compute_scope(store, &self.root_node_id, self.direction, self.max_depth, scorer);
        if let Some(plan_id) = &self.target_plan_id {
            let downstream: BTreeSet<NodeId> = store.descendants(plan_id).into_iter().collect();
            scope.retain(|id, _| id != plan_id && !downstream.contains(id));
        }
        scope
    }

    fn recompute_all(&mut self, store: &GraphStore, scorer: &dyn ScopeScorer) {
        self.scope = self.fresh_scope(store, scorer);
        self.refresh_suggestions(store);
        self.included = self.suggested_included.clone();
        self.excluded = self.suggested_excluded.clone();
        self.impact_global_detected = false;
        self.impacted_branch_ids.clear();
        tracing::debug!(
            root = %self.root_node_id,
            scoped = self.scope.len(),
            included = self.included.len(),
            "build scope recomputed"
        );
    }

    /// Partial refresh: only nodes whose branch list contains `branch` change
    fn recompute_branch(&mut self, store: &GraphStore, scorer: &dyn ScopeScorer, branch: &NodeId) {
        let fresh = self.fresh_scope(store, scorer);

        let leaving: Vec<NodeId> = self
            .scope
            .iter()
            .filter(|(id, entry)| entry.in_branch(branch) && !fresh.get(*id).is_some_and(|e| e.in_branch(branch)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in leaving {
            match fresh.get(&id) {
                Some(entry) => {
                    self.scope.insert(id, entry.clone());
                }
                None => {
                    self.scope.shift_remove(&id);
                    self.forget(&id);
                }
            }
        }

        for (id, entry) in fresh.iter().filter(|(_, e)| e.in_branch(branch)) {
            self.scope.insert(id.clone(), entry.clone());
            let pinned = store.node(id).is_some_and(Node::is_pinned);
            if pinned {
                self.pinned.insert(id.clone());
            }
            if include_by_default(store, &self.root_node_id, id, entry) {
                self.suggested_excluded.remove(id);
                self.suggested_included.insert(id.clone());
                self.excluded.remove(id);
                self.included.insert(id.clone());
            } else {
                self.suggested_included.remove(id);
                self.suggested_excluded.insert(id.clone());
                self.included.remove(id);
                self.excluded.insert(id.clone());
            }
        }

        self.impacted_branch_ids.remove(branch);
        tracing::debug!(root = %self.root_node_id, %branch, "build branch recomputed");
    }

    fn refresh_suggestions(&mut self, store: &GraphStore) {
        self.suggested_included.clear();
        self.suggested_excluded.clear();
        self.pinned.clear();
        for (id, entry) in &self.scope {
            if store.node(id).is_some_and(Node::is_pinned) {
                self.pinned.insert(id.clone());
            }
            if include_by_default(store, &self.root_node_id, id, entry) {
                self.suggested_included.insert(id.clone());
            } else {
                self.suggested_excluded.insert(id.clone());
            }
        }
    }

    fn forget(&mut self, id: &NodeId) {
        self.included.remove(id);
        self.excluded.remove(id);
        self.pinned.remove(id);
        self.suggested_included.remove(id);
        self.suggested_excluded.remove(id);
    }

    // ---- curation ----------------------------------------------------------

    /// Flip inclusion; including clears any exclusion first
    pub fn toggle_include(&mut self, id: &NodeId) {
        if !self.included.remove(id) {
            self.excluded.remove(id);
            self.included.insert(id.clone());
        }
    }

    /// Flip exclusion; excluding clears any inclusion first
    pub fn toggle_exclude(&mut self, id: &NodeId) {
        if !self.excluded.remove(id) {
            self.included.remove(id);
            self.excluded.insert(id.clone());
        }
    }

    /// Track a pin change made on the node itself
    pub(crate) fn note_pinned(&mut self, id: &NodeId, pinned: bool) {
        if pinned {
            self.pinned.insert(id.clone());
            self.excluded.remove(id);
            self.included.insert(id.clone());
        } else {
            self.pinned.remove(id);
        }
    }

    /// Scoped nodes whose branch list contains `branch`
    #[must_use]
    pub fn branch_members(&self, branch: &NodeId) -> Vec<NodeId> {
        self.scope
            .iter()
            .filter(|(_, e)| e.in_branch(branch))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn include_branch(&mut self, branch: &NodeId) {
        for id in self.branch_members(branch) {
            self.excluded.remove(&id);
            self.included.insert(id);
        }
    }

    /// Exclude every branch member that is not pinned
    pub fn exclude_branch(&mut self, branch: &NodeId) {
        for id in self.branch_members(branch) {
            if self.pinned.contains(&id) {
                continue;
            }
            self.included.remove(&id);
            self.excluded.insert(id);
        }
    }

    /// Discard curation, back to the scorer's recommendation
    pub fn reset_to_suggested(&mut self) {
        self.included = self.suggested_included.clone();
        self.excluded = self.suggested_excluded.clone();
    }

    // ---- graph change notifications -----------------------------------------

    /// React to a freshly inserted edge
    ///
    /// `target_parents_before` is the target's parent count before the edge
    /// existed. Returns `true` if the edge touched the session's scope.
    pub fn on_edge_added(
        &mut self,
        store: &GraphStore,
        scorer: &dyn ScopeScorer,
        source: &NodeId,
        target: &NodeId,
        target_parents_before: usize,
    ) -> bool {
        if !self.scope.contains_key(source) && !self.scope.contains_key(target) {
            return false;
        }

        let near_pivot = [source, target].iter().any(|id| {
            *id == &self.root_node_id || self.scope.get(*id).is_some_and(|e| e.depth <= 1)
        });
        let multi_parent = target_parents_before > 1;
        let critical = store.node(target).is_some_and(|n| is_critical(&n.prompt));

        let mut branches: BTreeSet<NodeId> = [source, target]
            .iter()
            .filter_map(|id| self.scope.get(*id))
            .flat_map(|e| e.branches.iter().cloned())
            .collect();
        if source == &self.root_node_id {
            branches.insert(target.clone());
        }
        if target == &self.root_node_id {
            branches.insert(source.clone());
        }

        if !self.frozen {
            for branch in &branches {
                self.recompute_branch(store, scorer, branch);
            }
        }

        if near_pivot {
            self.impact_global_detected = true;
        } else if multi_parent || critical {
            if branches.is_empty() {
                self.impact_global_detected = true;
            } else {
                self.impacted_branch_ids.extend(branches);
            }
        }
        tracing::debug!(
            %source,
            %target,
            near_pivot,
            multi_parent,
            critical,
            "edge touched build scope"
        );
        true
    }

    /// Drop references to a deleted node
    pub(crate) fn on_node_removed(&mut self, id: &NodeId) {
        self.scope.shift_remove(id);
        self.forget(id);
    }
}
