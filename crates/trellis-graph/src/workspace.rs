//! Workspace state container
//!
//! The only way to mutate the graph. Every public operation here keeps the
//! store, the undo history and the (optional) build session consistent with
//! each other; nothing outside this module touches the store mutably.
//!
//! History-recorded commands and their coalescing keys:
//!
//! | operation | key |
//! |-----------|-----|
//! | `add_node*`, `insert_node` | `addNode` |
//! | `create_child_node` | `child:<parent>` |
//! | `delete_node` | `delete:<id>` |
//! | `add_edge`, `connect` | `edge:<source>-><target>` |
//! | `delete_edge` | `deleteEdge:<id>` |
//! | `update_node_prompt` | `prompt:<id>` |
//! | derived nodes | `plan:<root>`, `artifact:<plan>`, `todo:<plan>` |
//! | plan rewiring | `scope:<plan>`, `refresh:<plan>` |
//!
//! Remote events and generation bookkeeping never touch history.

use crate::build::BuildSession;
use crate::clock::{Clock, SystemClock};
use crate::config::GraphConfig;
use crate::context::{ChatMessage, ContextAggregator};
use crate::error::GraphError;
use crate::history::HistoryManager;
use crate::prompts;
use crate::remote::{normalize_status, parse_position, RemoteEvent, RemoteNodePayload};
use crate::scope::{Direction, HeuristicScorer, ScopeScorer};
use crate::store::{apply_status, GraphStore, NodePatch};
use crate::types::{
    ArtifactKind, ArtifactPayload, EdgeId, Mode, Node, NodeId, NodeStatus, Orchestration, PlanPayload,
    PlanVersion, Point, Role,
};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Final result of a generation run, applied by [`Workspace::complete_generation`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationOutput {
    pub response: String,
    pub summary: Option<String>,
    pub tokens: Option<u32>,
}

/// Graph, history and build session behind one mutation API
#[derive(Debug)]
pub struct Workspace {
    store: GraphStore,
    history: HistoryManager,
    build: Option<BuildSession>,
    scorer: Arc<dyn ScopeScorer>,
    clock: Arc<dyn Clock>,
    aggregator: ContextAggregator,
    config: GraphConfig,
    /// Response each generating node had before its run started
    stashed_responses: HashMap<NodeId, String>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

impl Workspace {
    #[must_use]
    pub fn new(config: GraphConfig) -> Self {
        Self {
            store: GraphStore::new().with_child_offset(config.child_offset),
            history: HistoryManager::new(
                config.history_capacity,
                Duration::from_millis(config.coalesce_window_ms),
            ),
            build: None,
            scorer: Arc::new(HeuristicScorer),
            clock: Arc::new(SystemClock),
            aggregator: ContextAggregator::new(config.branch_label_chars, config.artifact_preview_chars),
            config,
            stashed_responses: HashMap::new(),
        }
    }

    /// Replace the build-scope scorer
    #[inline]
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn ScopeScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replace the clock used for history coalescing
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ---- reads -------------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.store.node(id)
    }

    #[inline]
    #[must_use]
    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    #[inline]
    #[must_use]
    pub fn build_session(&self) -> Option<&BuildSession> {
        self.build.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Model context for generating `target`
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `target` is unknown.
    pub fn build_context(&self, target: &NodeId) -> Result<Vec<ChatMessage>, GraphError> {
        self.aggregator.build(&self.store, target)
    }

    fn record(&mut self, key: &str) {
        let now = self.clock.now();
        let store = &self.store;
        self.history.record(key, now, || store.snapshot());
    }

    // ---- structural mutations (recorded) -------------------------------------

    pub fn add_node(&mut self, position: Point) -> NodeId {
        self.record("addNode");
        self.store.add_node(position)
    }

    pub fn add_node_with_prompt(&mut self, position: Point, prompt: impl Into<String>) -> NodeId {
        self.record("addNode");
        self.store.add_node_with_prompt(position, prompt)
    }

    /// Insert a prepared node under its own id; `false` if the id is taken
    pub fn insert_node(&mut self, node: Node) -> bool {
        if self.store.contains(&node.id) {
            return false;
        }
        self.record("addNode");
        self.store.insert_node(node)
    }

    /// New node below-right of `parent`, linked to it
    ///
    /// Returns `None` if `parent` does not exist. The orchestration override
    /// is only applied once the edge is in place.
    pub fn create_child_node(
        &mut self,
        parent: &NodeId,
        prompt: impl Into<String>,
        orchestration: Option<Orchestration>,
    ) -> Option<NodeId> {
        if !self.store.contains(parent) {
            return None;
        }
        self.record(&format!("child:{parent}"));

        let position = self.store.child_position(parent);
        let child = self.store.add_node_with_prompt(position, prompt);
        if self.add_edge_unrecorded(parent, &child).is_some() {
            if let Some(orchestration) = orchestration {
                self.store.update_node(&child, NodePatch::new().orchestration(orchestration));
            }
        }
        Some(child)
    }

    /// Remove a node and every incident edge; `false` for unknown ids
    pub fn delete_node(&mut self, id: &NodeId) -> bool {
        if !self.store.contains(id) {
            return false;
        }
        self.record(&format!("delete:{id}"));
        self.remove_node_unrecorded(id)
    }

    /// Link `source -> target` without an acyclicity check
    ///
    /// Returns `None` without recording when the store would reject the edge
    /// (duplicate pair, unknown endpoint, self loop).
    pub fn add_edge(&mut self, source: &NodeId, target: &NodeId) -> Option<EdgeId> {
        if source == target
            || !self.store.contains(source)
            || !self.store.contains(target)
            || self.store.find_edge(source, target).is_some()
        {
            return None;
        }
        self.record(&format!("edge:{source}->{target}"));
        self.add_edge_unrecorded(source, target)
    }

    /// Link `source -> target` after checking the edge keeps the graph acyclic
    ///
    /// `Ok(None)` means the pair was already linked.
    ///
    /// # Errors
    /// - `GraphError::NodeNotFound` for an unknown endpoint
    /// - `GraphError::SelfLoop` when `source == target`
    /// - `GraphError::CycleRejected` when `source` is reachable from `target`
    pub fn connect(&mut self, source: &NodeId, target: &NodeId) -> Result<Option<EdgeId>, GraphError> {
        for id in [source, target] {
            if !self.store.contains(id) {
                return Err(GraphError::NodeNotFound(id.clone()));
            }
        }
        if source == target {
            return Err(GraphError::SelfLoop(source.clone()));
        }
        if self.store.is_reachable(target, source) {
            return Err(GraphError::CycleRejected {
                from: source.clone(),
                to: target.clone(),
            });
        }
        Ok(self.add_edge(source, target))
    }

    pub fn delete_edge(&mut self, id: &EdgeId) -> bool {
        if self.store.edge(id).is_none() {
            return false;
        }
        self.record(&format!("deleteEdge:{id}"));
        self.store.delete_edge(id)
    }

    /// Replace a prompt and cascade staleness; `false` if unknown or unchanged
    pub fn update_node_prompt(&mut self, id: &NodeId, prompt: impl Into<String>) -> bool {
        let prompt = prompt.into();
        match self.store.node(id) {
            Some(node) if node.prompt != prompt => {}
            _ => return false,
        }
        self.record(&format!("prompt:{id}"));
        self.store.update_node_prompt(id, prompt)
    }

    fn add_edge_unrecorded(&mut self, source: &NodeId, target: &NodeId) -> Option<EdgeId> {
        let parents_before = self.store.node(target).map_or(0, |n| n.parent_ids.len());
        let edge = self.store.add_edge(source, target)?;
        if let Some(session) = self.build.as_mut() {
            session.on_edge_added(&self.store, self.scorer.as_ref(), source, target, parents_before);
        }
        Some(edge)
    }

    fn remove_node_unrecorded(&mut self, id: &NodeId) -> bool {
        if !self.store.delete_node(id) {
            return false;
        }
        self.forget_node(id);
        true
    }

    /// Drop per-node side state for a node that no longer exists
    fn forget_node(&mut self, id: &NodeId) {
        self.stashed_responses.remove(id);
        let root_gone = self.build.as_ref().is_some_and(|s| s.root_node_id() == id);
        if root_gone {
            tracing::info!(node_id = %id, "build root removed, ending build session");
            self.build = None;
        } else if let Some(session) = self.build.as_mut() {
            session.on_node_removed(id);
        }
    }

    // ---- field writes (not recorded) -----------------------------------------

    /// Shallow-merge fields; no-op for unknown ids
    pub fn update_node(&mut self, id: &NodeId, patch: NodePatch) -> bool {
        if !self.store.update_node(id, patch) {
            return false;
        }
        self.sync_pin(id);
        true
    }

    pub fn set_node_status(&mut self, id: &NodeId, status: NodeStatus) -> bool {
        self.store.set_node_status(id, status)
    }

    pub fn update_node_response(&mut self, id: &NodeId, response: impl Into<String>) -> bool {
        self.store.update_node_response(id, response)
    }

    pub fn update_node_summary(&mut self, id: &NodeId, summary: impl Into<String>) -> bool {
        self.store.update_node_summary(id, summary)
    }

    /// Mark every non-generating descendant of `root` stale
    ///
    /// Returns the affected ids in breadth-first order, ready for sequential
    /// regeneration.
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `root` is unknown.
    pub fn cascade_stale(&mut self, root: &NodeId) -> Result<Vec<NodeId>, GraphError> {
        if !self.store.contains(root) {
            return Err(GraphError::NodeNotFound(root.clone()));
        }
        let marked = self.store.mark_descendants_stale(root);
        tracing::debug!(node_id = %root, stale = marked.len(), "cascade marked descendants stale");
        Ok(marked)
    }

    pub fn select(&mut self, id: &NodeId) -> bool {
        self.store.select(id)
    }

    pub fn deselect(&mut self, id: &NodeId) -> bool {
        self.store.deselect(id)
    }

    pub fn clear_selection(&mut self) {
        self.store.clear_selection();
    }

    pub fn set_project_name(&mut self, name: impl Into<String>) {
        self.store.set_project_name(name);
    }

    fn sync_pin(&mut self, id: &NodeId) {
        let pinned = self.store.node(id).is_some_and(Node::is_pinned);
        if let Some(session) = self.build.as_mut() {
            if session.scope().contains_key(id) && session.pinned().contains(id) != pinned {
                session.note_pinned(id, pinned);
            }
        }
    }

    // ---- undo / redo ---------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        let current = self.store.snapshot();
        match self.history.undo(current) {
            Some(previous) => {
                self.store.restore(previous);
                self.after_restore();
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        let current = self.store.snapshot();
        match self.history.redo(current) {
            Some(next) => {
                self.store.restore(next);
                self.after_restore();
                true
            }
            None => false,
        }
    }

    fn after_restore(&mut self) {
        let store = &self.store;
        self.stashed_responses.retain(|id, _| store.contains(id));

        let missing: Vec<NodeId> = self
            .build
            .as_ref()
            .map(|s| {
                s.scope()
                    .keys()
                    .chain(std::iter::once(s.root_node_id()))
                    .filter(|id| !self.store.contains(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for id in missing {
            self.forget_node(&id);
        }
    }

    // ---- build sessions ------------------------------------------------------

    fn session_mut(&mut self) -> Result<&mut BuildSession, GraphError> {
        self.build.as_mut().ok_or(GraphError::NoBuildSession)
    }

    fn require_node(&self, id: &NodeId) -> Result<&Node, GraphError> {
        self.store.node(id).ok_or_else(|| GraphError::NodeNotFound(id.clone()))
    }

    /// Open a build session around `root`, replacing any live one
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `root` is unknown.
    pub fn start_build_session(&mut self, root: &NodeId) -> Result<(), GraphError> {
        let session = BuildSession::start(&self.store, root, self.config.build, self.scorer.as_ref())?;
        tracing::info!(
            root = %root,
            scoped = session.scope().len(),
            included = session.included().len(),
            "build session started"
        );
        self.build = Some(session);
        Ok(())
    }

    /// Like [`Self::start_build_session`], with the deliverable seeded from the
    /// root's summary (or prompt)
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `root` is unknown.
    pub fn start_build_from_node(&mut self, root: &NodeId) -> Result<(), GraphError> {
        let node = self.require_node(root)?;
        let seed = node
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| node.prompt.clone());
        self.start_build_session(root)?;
        self.session_mut()?.set_deliverable(seed);
        Ok(())
    }

    /// Open a session that edits which nodes feed an existing plan
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` or `GraphError::NotAPlan`.
    pub fn start_plan_scope_edit(&mut self, plan: &NodeId) -> Result<(), GraphError> {
        let session = BuildSession::for_plan(&self.store, plan, self.config.build, self.scorer.as_ref())?;
        tracing::info!(plan_id = %plan, included = session.included().len(), "plan scope edit started");
        self.build = Some(session);
        Ok(())
    }

    /// Discard the live session; `false` if there was none
    pub fn end_build_session(&mut self) -> bool {
        self.build.take().is_some()
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn set_build_deliverable(&mut self, text: impl Into<String>) -> Result<(), GraphError> {
        self.session_mut()?.set_deliverable(text);
        Ok(())
    }

    /// Change traversal shape; curation resets to the new suggestion
    ///
    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn set_build_scope_config(
        &mut self,
        direction: Option<Direction>,
        max_depth: Option<u32>,
    ) -> Result<(), GraphError> {
        let session = self.build.as_mut().ok_or(GraphError::NoBuildSession)?;
        session.set_config(&self.store, self.scorer.as_ref(), direction, max_depth);
        Ok(())
    }

    /// Global refresh (`None`) or a partial refresh of one branch
    ///
    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn recompute_build_suggestions(&mut self, branch: Option<&NodeId>) -> Result<(), GraphError> {
        let session = self.build.as_mut().ok_or(GraphError::NoBuildSession)?;
        session.recompute(&self.store, self.scorer.as_ref(), branch);
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession` or `GraphError::NodeNotFound`.
    pub fn toggle_build_include(&mut self, id: &NodeId) -> Result<(), GraphError> {
        self.require_node(id)?;
        self.session_mut()?.toggle_include(id);
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession` or `GraphError::NodeNotFound`.
    pub fn toggle_build_exclude(&mut self, id: &NodeId) -> Result<(), GraphError> {
        self.require_node(id)?;
        self.session_mut()?.toggle_exclude(id);
        Ok(())
    }

    /// Flip the node's own pinned flag; returns the new state
    ///
    /// # Errors
    /// `GraphError::NoBuildSession` or `GraphError::NodeNotFound`.
    pub fn toggle_build_pin(&mut self, id: &NodeId) -> Result<bool, GraphError> {
        if self.build.is_none() {
            return Err(GraphError::NoBuildSession);
        }
        let pinned = !self.require_node(id)?.is_pinned();
        self.set_pinned(id, pinned)?;
        Ok(pinned)
    }

    fn set_pinned(&mut self, id: &NodeId, pinned: bool) -> Result<(), GraphError> {
        self.store.modify_node(id, |node| node.orchestration.pinned = pinned);
        self.session_mut()?.note_pinned(id, pinned);
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn include_build_branch(&mut self, branch: &NodeId) -> Result<(), GraphError> {
        self.session_mut()?.include_branch(branch);
        Ok(())
    }

    /// Exclude every branch member except pinned ones
    ///
    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn exclude_build_branch(&mut self, branch: &NodeId) -> Result<(), GraphError> {
        self.session_mut()?.exclude_branch(branch);
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn pin_build_branch(&mut self, branch: &NodeId) -> Result<(), GraphError> {
        self.set_branch_pinned(branch, true)
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn unpin_build_branch(&mut self, branch: &NodeId) -> Result<(), GraphError> {
        self.set_branch_pinned(branch, false)
    }

    fn set_branch_pinned(&mut self, branch: &NodeId, pinned: bool) -> Result<(), GraphError> {
        let members = self
            .build
            .as_ref()
            .ok_or(GraphError::NoBuildSession)?
            .branch_members(branch);
        for id in members {
            self.set_pinned(&id, pinned)?;
        }
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn reset_build_to_suggested(&mut self) -> Result<(), GraphError> {
        self.session_mut()?.reset_to_suggested();
        Ok(())
    }

    /// # Errors
    /// `GraphError::NoBuildSession`
    pub fn set_build_frozen(&mut self, frozen: bool) -> Result<(), GraphError> {
        self.session_mut()?.set_frozen(frozen);
        Ok(())
    }

    // ---- derived nodes ---------------------------------------------------------

    /// Turn the live session into a plan node
    ///
    /// No-op (`None`) without a session or with a blank deliverable. On success
    /// the plan is wired from every included node (root always) and the session
    /// ends. Generation is the caller's to schedule.
    pub fn generate_plan_from_build_session(&mut self) -> Option<NodeId> {
        let session = self.build.as_ref()?;
        let deliverable = session.deliverable().trim().to_string();
        if deliverable.is_empty() {
            tracing::debug!("plan generation skipped, deliverable is empty");
            return None;
        }
        let root = session.root_node_id().clone();
        let included: Vec<NodeId> = session
            .effective_included()
            .into_iter()
            .filter(|id| self.store.contains(id))
            .collect();
        let fingerprint = prompts::scope_fingerprint(&included);

        self.record(&format!("plan:{root}"));
        self.build = None;

        let mut orchestration = Orchestration::with_role(Role::Plan).with_mode(Mode::Build);
        orchestration.plan = Some(PlanPayload {
            build_root_id: root.clone(),
            deliverable: deliverable.clone(),
            versions: vec![PlanVersion {
                version: 1,
                content: String::new(),
                scope_fingerprint: fingerprint.clone(),
                included_node_ids: included.clone(),
                created_at: Utc::now(),
            }],
            active_version: 1,
            is_stale: false,
        });

        let plan_id = self.spawn_derived(&root, prompts::plan_prompt(&deliverable), orchestration, &included);
        tracing::info!(
            plan_id = %plan_id,
            root = %root,
            included = included.len(),
            fingerprint = %fingerprint,
            "plan created from build session"
        );
        Some(plan_id)
    }

    /// Deliverable artifact wired from a plan and its scope parents
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` or `GraphError::NotAPlan`.
    pub fn generate_artifact_from_plan(&mut self, plan: &NodeId) -> Result<NodeId, GraphError> {
        self.derive_from_plan(plan, ArtifactKind::Deliverable)
    }

    /// Todo-list artifact wired from a plan and its scope parents
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` or `GraphError::NotAPlan`.
    pub fn generate_todo_from_plan(&mut self, plan: &NodeId) -> Result<NodeId, GraphError> {
        self.derive_from_plan(plan, ArtifactKind::Todo)
    }

    fn derive_from_plan(&mut self, plan_id: &NodeId, kind: ArtifactKind) -> Result<NodeId, GraphError> {
        let node = self.require_node(plan_id)?;
        let plan = node
            .orchestration
            .plan
            .as_ref()
            .ok_or_else(|| GraphError::NotAPlan(plan_id.clone()))?;

        let scope_parents = plan
            .active()
            .map_or_else(|| node.parent_ids.clone(), |v| v.included_node_ids.clone());
        let mut parents = vec![plan_id.clone()];
        parents.extend(
            scope_parents
                .into_iter()
                .filter(|id| id != plan_id && self.store.contains(id)),
        );
        let (prompt, key) = match kind {
            ArtifactKind::Deliverable => (prompts::artifact_prompt(&plan.deliverable), "artifact"),
            ArtifactKind::Todo => (prompts::todo_prompt(&plan.deliverable), "todo"),
        };
        let active_version = plan.active_version;

        self.record(&format!("{key}:{plan_id}"));

        let mut orchestration = Orchestration::with_role(Role::Artifact).with_mode(Mode::Build);
        orchestration.artifact = Some(ArtifactPayload {
            kind,
            plan_id: Some(plan_id.clone()),
            plan_version: Some(active_version),
            todo_items: Vec::new(),
        });
        let id = self.spawn_derived(plan_id, prompt, orchestration, &parents);
        tracing::info!(node_id = %id, plan_id = %plan_id, ?kind, "artifact created from plan");
        Ok(id)
    }

    /// Create a derived node near `anchor` and link it from `parents`
    fn spawn_derived(
        &mut self,
        anchor: &NodeId,
        prompt: String,
        orchestration: Orchestration,
        parents: &[NodeId],
    ) -> NodeId {
        let mut node = Node::new(NodeId::generate(), self.store.child_position(anchor), prompt);
        node.orchestration = orchestration;
        let id = node.id.clone();
        self.store.insert_node(node);
        for parent in parents {
            self.add_edge_unrecorded(parent, &id);
        }
        id
    }

    /// Append an empty version and reset the plan for regeneration
    ///
    /// The new version's fingerprint is taken from the plan's current parents.
    /// Returns the new version number.
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` or `GraphError::NotAPlan`.
    pub fn refresh_plan_version(&mut self, plan_id: &NodeId) -> Result<u32, GraphError> {
        let node = self.require_node(plan_id)?;
        let plan = node
            .orchestration
            .plan
            .as_ref()
            .ok_or_else(|| GraphError::NotAPlan(plan_id.clone()))?;
        let version = plan.latest_version() + 1;
        let parents = node.parent_ids.clone();
        let prompt = prompts::plan_prompt(&plan.deliverable);

        self.record(&format!("refresh:{plan_id}"));
        self.store.modify_node(plan_id, |node| {
            node.prompt = prompt;
            node.response.clear();
            node.status = NodeStatus::Idle;
            if let Some(plan) = node.orchestration.plan.as_mut() {
                plan.versions.push(PlanVersion {
                    version,
                    content: String::new(),
                    scope_fingerprint: prompts::scope_fingerprint(&parents),
                    included_node_ids: parents,
                    created_at: Utc::now(),
                });
                plan.active_version = version;
                plan.is_stale = false;
            }
        });
        tracing::info!(plan_id = %plan_id, version, "plan version added");
        Ok(version)
    }

    /// Show a stored version's content
    ///
    /// # Errors
    /// `GraphError::NodeNotFound`, `GraphError::NotAPlan` or
    /// `GraphError::UnknownPlanVersion`.
    pub fn set_active_plan_version(&mut self, plan_id: &NodeId, version: u32) -> Result<(), GraphError> {
        let node = self.require_node(plan_id)?;
        let plan = node
            .orchestration
            .plan
            .as_ref()
            .ok_or_else(|| GraphError::NotAPlan(plan_id.clone()))?;
        let content = plan
            .version(version)
            .map(|v| v.content.clone())
            .ok_or_else(|| GraphError::UnknownPlanVersion {
                plan: plan_id.clone(),
                version,
            })?;

        self.store.modify_node(plan_id, |node| {
            node.response = content;
            node.status = NodeStatus::Idle;
            if let Some(plan) = node.orchestration.plan.as_mut() {
                plan.active_version = version;
            }
        });
        Ok(())
    }

    /// Rewire the targeted plan's parents to the curated set and end the session
    ///
    /// Nodes downstream of the plan are never wired in, so the rewrite cannot
    /// close a cycle.
    ///
    /// # Errors
    /// - `GraphError::NoBuildSession`
    /// - `GraphError::NotPlanScopeEdit` when the session is not editing a plan
    /// - `GraphError::NodeNotFound` if the plan has been deleted meanwhile
    pub fn apply_build_scope_to_plan(&mut self) -> Result<NodeId, GraphError> {
        let session = self.build.as_ref().ok_or(GraphError::NoBuildSession)?;
        let plan_id = session
            .target_plan_id()
            .cloned()
            .ok_or(GraphError::NotPlanScopeEdit)?;
        let current: BTreeSet<NodeId> = self.require_node(&plan_id)?.parent_ids.iter().cloned().collect();

        let downstream: BTreeSet<NodeId> = self.store.descendants(&plan_id).into_iter().collect();
        let wanted: BTreeSet<NodeId> = session
            .effective_included()
            .into_iter()
            .filter(|id| id != &plan_id && !downstream.contains(id) && self.store.contains(id))
            .collect();

        self.record(&format!("scope:{plan_id}"));
        self.build = None;

        for parent in current.difference(&wanted) {
            let edge = self.store.find_edge(parent, &plan_id).map(|e| e.id.clone());
            if let Some(edge) = edge {
                self.store.delete_edge(&edge);
            }
        }
        for parent in wanted.difference(&current) {
            self.store.add_edge(parent, &plan_id);
        }
        self.store.set_node_status(&plan_id, NodeStatus::Stale);

        tracing::info!(
            plan_id = %plan_id,
            parents = wanted.len(),
            "build scope applied to plan"
        );
        Ok(plan_id)
    }

    // ---- generation bookkeeping ------------------------------------------------

    /// Enter `loading`: stash the current response and record the model
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `id` is unknown.
    pub fn begin_generation(
        &mut self,
        id: &NodeId,
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<(), GraphError> {
        let previous = self.require_node(id)?.response.clone();
        self.stashed_responses.entry(id.clone()).or_insert(previous);
        self.store.modify_node(id, |node| {
            node.response.clear();
            apply_status(node, NodeStatus::Loading);
            node.orchestration.generation.model = model.map(str::to_string);
            node.orchestration.generation.temperature = temperature;
            node.orchestration.generation.last_error = None;
        });
        Ok(())
    }

    /// Mirror a streamed delta; ignored unless the node is loading
    pub fn append_generation_chunk(&mut self, id: &NodeId, chunk: &str) -> bool {
        let loading = self.store.node(id).is_some_and(|n| n.status.is_generating());
        loading && self.store.modify_node(id, |node| node.response.push_str(chunk))
    }

    /// Apply a finished run and return to `idle`
    ///
    /// Plans also get the content written into their active version; todo
    /// artifacts get their checklist parsed.
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if `id` is unknown.
    pub fn complete_generation(&mut self, id: &NodeId, output: GenerationOutput) -> Result<(), GraphError> {
        self.require_node(id)?;
        self.stashed_responses.remove(id);
        let GenerationOutput {
            response,
            summary,
            tokens,
        } = output;

        self.store.modify_node(id, |node| {
            if let Some(plan) = node.orchestration.plan.as_mut() {
                let active = plan.active_version;
                if let Some(version) = plan.version_mut(active) {
                    version.content = response.clone();
                }
                plan.is_stale = false;
            }
            if let Some(artifact) = node.orchestration.artifact.as_mut() {
                if artifact.kind == ArtifactKind::Todo {
                    artifact.todo_items = prompts::parse_todo_items(&response);
                }
            }
            node.response = response;
            node.summary = summary;
            node.status = NodeStatus::Idle;
            node.orchestration.generation.tokens = tokens;
            node.orchestration.generation.last_error = None;
        });
        Ok(())
    }

    /// Enter `error`, keeping the pre-run response and the error message
    pub fn fail_generation(&mut self, id: &NodeId, message: impl Into<String>) -> bool {
        let message = message.into();
        let previous = self.stashed_responses.remove(id);
        self.store.modify_node(id, |node| {
            if let Some(previous) = previous {
                node.response = previous;
            }
            node.status = NodeStatus::Error;
            node.orchestration.generation.last_error = Some(message);
        })
    }

    /// Abandon a run: restore the pre-run response and return to `idle`
    pub fn cancel_generation(&mut self, id: &NodeId) -> bool {
        let previous = self.stashed_responses.remove(id);
        self.store.modify_node(id, |node| {
            if let Some(previous) = previous {
                node.response = previous;
            }
            node.status = NodeStatus::Idle;
        })
    }

    // ---- remote reconciliation -------------------------------------------------

    /// Fold a collaborator's event into the graph without touching history
    ///
    /// A create for a known id is treated as an update. Positions that fail
    /// validation are dropped; parents that do not exist locally, or whose link
    /// would close a cycle, are skipped.
    ///
    /// # Errors
    /// - `GraphError::InvalidRemoteEvent` for an unknown status string
    /// - `GraphError::NodeNotFound` for an update of an unknown node
    pub fn apply_remote(&mut self, event: RemoteEvent) -> Result<(), GraphError> {
        tracing::debug!(node_id = %event.node_id(), "applying remote event");
        match event {
            RemoteEvent::Deleted { id } => {
                self.remove_node_unrecorded(&id);
                Ok(())
            }
            RemoteEvent::Created { node } if !self.store.contains(&node.id) => {
                let status = remote_status(&node)?;
                let position = node.position.as_ref().and_then(parse_position).unwrap_or_default();
                let mut local = Node::new(node.id.clone(), position, node.prompt.clone().unwrap_or_default());
                local.response = node.response.clone().unwrap_or_default();
                local.summary = node.summary.clone();
                local.status = status.unwrap_or_default();
                if let Some(orchestration) = node.orchestration.clone() {
                    local.orchestration = orchestration;
                }
                self.store.insert_node(local);
                self.sync_remote_parents(&node);
                Ok(())
            }
            RemoteEvent::Created { node } | RemoteEvent::Updated { node } => self.apply_remote_update(&node),
        }
    }

    fn apply_remote_update(&mut self, remote: &RemoteNodePayload) -> Result<(), GraphError> {
        let id = &remote.id;
        self.require_node(id)?;
        let status = remote_status(remote)?;

        let mut patch = NodePatch::new();
        if let Some(response) = &remote.response {
            patch = patch.response(response.clone());
        }
        if let Some(summary) = &remote.summary {
            patch = patch.summary(Some(summary.clone()));
        }
        if let Some(raw) = &remote.position {
            match parse_position(raw) {
                Some(point) => patch = patch.position(point),
                None => tracing::warn!(node_id = %id, position = %raw, "dropping invalid remote position"),
            }
        }
        if let Some(orchestration) = &remote.orchestration {
            patch = patch.orchestration(orchestration.clone());
        }
        if !patch.is_empty() {
            self.update_node(id, patch);
        }
        if let Some(prompt) = &remote.prompt {
            self.store.update_node_prompt(id, prompt.clone());
        }
        if let Some(status) = status {
            self.store.set_node_status(id, status);
        }
        self.sync_remote_parents(remote);
        Ok(())
    }

    /// Diff the remote parent list against local edges
    fn sync_remote_parents(&mut self, remote: &RemoteNodePayload) {
        let Some(wanted) = &remote.parent_ids else {
            return;
        };
        let id = &remote.id;
        let Some(node) = self.store.node(id) else {
            return;
        };
        let current = node.parent_ids.clone();

        for parent in current.iter().filter(|p| !wanted.contains(p)) {
            let edge = self.store.find_edge(parent, id).map(|e| e.id.clone());
            if let Some(edge) = edge {
                self.store.delete_edge(&edge);
            }
        }
        for parent in wanted.iter().filter(|p| !current.contains(p)) {
            if !self.store.contains(parent) || self.store.is_reachable(id, parent) {
                tracing::warn!(node_id = %id, parent = %parent, "skipping remote parent link");
                continue;
            }
            self.add_edge_unrecorded(parent, id);
        }
    }
}

fn remote_status(node: &RemoteNodePayload) -> Result<Option<NodeStatus>, GraphError> {
    node.status
        .as_deref()
        .map(|raw| {
            normalize_status(raw)
                .ok_or_else(|| GraphError::InvalidRemoteEvent(format!("unknown status {raw:?} for {}", node.id)))
        })
        .transpose()
}
