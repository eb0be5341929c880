//! Build scope computation
//!
//! Walks outward from a pivot node and scores every reachable node:
//! - each first hop from the pivot opens a *branch*, identified by that hop's node id
//! - traversal continues in the hop's direction (parents upward, children downward)
//! - a node reached through several first hops belongs to every such branch
//! - scoring is delegated to a pluggable [`ScopeScorer`]

use crate::heuristics::is_critical;
use crate::store::GraphStore;
use crate::types::{Node, NodeId, NodeStatus, Role};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;

/// Which links the scope walk follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Parents,
    Children,
    #[default]
    Both,
}

impl Direction {
    fn includes_parents(self) -> bool {
        matches!(self, Direction::Parents | Direction::Both)
    }

    fn includes_children(self) -> bool {
        matches!(self, Direction::Children | Direction::Both)
    }
}

/// Coarse relevance bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Tier 1
    High,
    /// Tier 2
    Medium,
    /// Tier 3, excluded by default
    Low,
}

impl Tier {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Tier::High => 1,
            Tier::Medium => 2,
            Tier::Low => 3,
        }
    }
}

/// Where a node sits relative to the pivot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePlacement {
    pub depth: u32,
    pub branches: Vec<NodeId>,
}

/// Scorer verdict for one node
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub tier: Tier,
    pub reasons: Vec<String>,
}

/// One scored node in a build scope
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeEntry {
    pub depth: u32,
    pub branches: Vec<NodeId>,
    pub score: f64,
    pub tier: Tier,
    pub reasons: Vec<String>,
}

impl ScopeEntry {
    #[inline]
    #[must_use]
    pub fn in_branch(&self, branch: &NodeId) -> bool {
        self.branches.contains(branch)
    }
}

/// Pluggable relevance scorer
pub trait ScopeScorer: Send + Sync + Debug {
    fn score(&self, node: &Node, placement: &ScopePlacement) -> ScoreResult;
}

/// Default scorer: proximity first, nudged by role, pins and keywords
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl ScopeScorer for HeuristicScorer {
    fn score(&self, node: &Node, placement: &ScopePlacement) -> ScoreResult {
        let mut reasons = vec![format!("depth {}", placement.depth)];
        let mut score = 1.0 / (f64::from(placement.depth) + 1.0);

        if node.is_pinned() {
            score += 1.0;
            reasons.push("pinned".to_string());
        }
        if is_critical(&node.prompt) {
            score += 0.3;
            reasons.push("critical keyword".to_string());
        }
        match node.role() {
            Role::Source => {
                score += 0.2;
                reasons.push("source material".to_string());
            }
            Role::Plan => {
                score += 0.1;
                reasons.push("plan".to_string());
            }
            Role::Challenger => {
                score -= 0.1;
                reasons.push("challenger".to_string());
            }
            _ => {}
        }
        if !node.response.trim().is_empty() {
            score += 0.1;
            reasons.push("has response".to_string());
        }
        if node.status == NodeStatus::Stale {
            score -= 0.1;
            reasons.push("stale".to_string());
        }
        if placement.branches.len() > 1 {
            score += 0.1;
            reasons.push(format!("shared by {} branches", placement.branches.len()));
        }

        let tier = if score >= 0.6 {
            Tier::High
        } else if score >= 0.35 {
            Tier::Medium
        } else {
            Tier::Low
        };
        ScoreResult { score, tier, reasons }
    }
}

/// Score every node within `max_depth` hops of `root`
///
/// The root is always present at depth 0 with no branches. Unknown roots
/// yield an empty scope.
#[must_use]
pub fn compute_scope(
    store: &GraphStore,
    root: &NodeId,
    direction: Direction,
    max_depth: u32,
    scorer: &dyn ScopeScorer,
) -> IndexMap<NodeId, ScopeEntry> {
    let Some(root_node) = store.node(root) else {
        return IndexMap::new();
    };

    let mut placements: IndexMap<NodeId, ScopePlacement> = IndexMap::new();
    placements.insert(
        root.clone(),
        ScopePlacement {
            depth: 0,
            branches: Vec::new(),
        },
    );

    if max_depth > 0 {
        let mut hops: Vec<(&NodeId, bool)> = Vec::new();
        if direction.includes_parents() {
            hops.extend(root_node.parent_ids.iter().map(|id| (id, true)));
        }
        if direction.includes_children() {
            hops.extend(root_node.children_ids.iter().map(|id| (id, false)));
        }

        for (branch, upward) in hops {
            walk_branch(store, root, branch, upward, max_depth, &mut placements);
        }
    }

    placements
        .into_iter()
        .filter_map(|(id, placement)| {
            let node = store.node(&id)?;
            let verdict = scorer.score(node, &placement);
            Some((
                id,
                ScopeEntry {
                    depth: placement.depth,
                    branches: placement.branches,
                    score: verdict.score,
                    tier: verdict.tier,
                    reasons: verdict.reasons,
                },
            ))
        })
        .collect()
}

fn walk_branch(
    store: &GraphStore,
    root: &NodeId,
    branch: &NodeId,
    upward: bool,
    max_depth: u32,
    placements: &mut IndexMap<NodeId, ScopePlacement>,
) {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<(NodeId, u32)> = VecDeque::from([(branch.clone(), 1)]);

    while let Some((id, depth)) = queue.pop_front() {
        if &id == root || !seen.insert(id.clone()) {
            continue;
        }
        let Some(node) = store.node(&id) else {
            continue;
        };

        let placement = placements.entry(id.clone()).or_insert_with(|| ScopePlacement {
            depth,
            branches: Vec::new(),
        });
        placement.depth = placement.depth.min(depth);
        if !placement.branches.contains(branch) {
            placement.branches.push(branch.clone());
        }

        if depth < max_depth {
            let next = if upward { &node.parent_ids } else { &node.children_ids };
            queue.extend(next.iter().map(|n| (n.clone(), depth + 1)));
        }
    }
}

/// Default inclusion rule: pinned, the root itself, or anything above the lowest tier
#[must_use]
pub fn include_by_default(store: &GraphStore, root: &NodeId, id: &NodeId, entry: &ScopeEntry) -> bool {
    id == root || entry.tier != Tier::Low || store.node(id).is_some_and(Node::is_pinned)
}
