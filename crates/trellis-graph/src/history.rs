//! Undo/redo history
//!
//! Two bounded stacks of pre-mutation snapshots. Mutations that share a
//! command key within the coalesce window collapse into one undo step, so
//! typing into a prompt does not flood the past stack.

use crate::types::{Edge, EdgeId, Node, NodeId};
use indexmap::IndexMap;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Versioned slice of the workspace
///
/// Settings, viewport and build sessions are deliberately absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistorySnapshot {
    pub nodes: IndexMap<NodeId, Node>,
    pub edges: IndexMap<EdgeId, Edge>,
    pub selected: BTreeSet<NodeId>,
    pub project_name: String,
}

/// Coalescing past/future stacks
#[derive(Debug)]
pub struct HistoryManager {
    past: VecDeque<HistorySnapshot>,
    future: Vec<HistorySnapshot>,
    capacity: usize,
    coalesce_window: Duration,
    last_push: Option<(String, Instant)>,
}

impl HistoryManager {
    #[must_use]
    pub fn new(capacity: usize, coalesce_window: Duration) -> Self {
        Self {
            past: VecDeque::new(),
            future: Vec::new(),
            capacity: capacity.max(1),
            coalesce_window,
            last_push: None,
        }
    }

    /// Record a pre-mutation snapshot under `key`
    ///
    /// The snapshot closure is only evaluated when a push actually happens.
    /// Returns `false` when the mutation was coalesced into the previous step.
    pub fn record(
        &mut self,
        key: &str,
        now: Instant,
        snapshot: impl FnOnce() -> HistorySnapshot,
    ) -> bool {
        if let Some((last_key, at)) = &self.last_push {
            if last_key == key && now.saturating_duration_since(*at) < self.coalesce_window {
                tracing::trace!(key, "history step coalesced");
                return false;
            }
        }

        self.past.push_back(snapshot());
        while self.past.len() > self.capacity {
            self.past.pop_front();
        }
        self.future.clear();
        self.last_push = Some((key.to_string(), now));
        true
    }

    /// Step back; `current` goes onto the future stack
    pub fn undo(&mut self, current: HistorySnapshot) -> Option<HistorySnapshot> {
        let previous = self.past.pop_back()?;
        self.future.push(current);
        if self.future.len() > self.capacity {
            self.future.remove(0);
        }
        self.last_push = None;
        Some(previous)
    }

    /// Step forward; `current` goes back onto the past stack
    pub fn redo(&mut self, current: HistorySnapshot) -> Option<HistorySnapshot> {
        let next = self.future.pop()?;
        self.past.push_back(current);
        while self.past.len() > self.capacity {
            self.past.pop_front();
        }
        self.last_push = None;
        Some(next)
    }

    #[inline]
    #[must_use]
    pub fn past_len(&self) -> usize {
        self.past.len()
    }

    #[inline]
    #[must_use]
    pub fn future_len(&self) -> usize {
        self.future.len()
    }

    #[inline]
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
        self.last_push = None;
    }
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50, Duration::from_millis(750))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> HistorySnapshot {
        HistorySnapshot {
            project_name: name.to_string(),
            ..HistorySnapshot::default()
        }
    }

    #[test]
    fn same_key_inside_window_coalesces() {
        let mut history = HistoryManager::default();
        let t0 = Instant::now();

        assert!(history.record("prompt:a", t0, || named("0")));
        assert!(!history.record("prompt:a", t0 + Duration::from_millis(300), || named("1")));
        assert!(history.record("prompt:b", t0 + Duration::from_millis(400), || named("2")));
        assert!(history.record("prompt:b", t0 + Duration::from_millis(1200), || named("3")));

        assert_eq!(history.past_len(), 3);
    }

    #[test]
    fn past_is_capped() {
        let mut history = HistoryManager::new(3, Duration::from_millis(750));
        let t0 = Instant::now();
        for i in 0..5u64 {
            history.record("k", t0 + Duration::from_secs(i), || named(&i.to_string()));
        }
        assert_eq!(history.past_len(), 3);

        // Oldest entries were dropped
        let oldest = {
            let mut last = None;
            while let Some(s) = history.undo(named("cur")) {
                last = Some(s);
            }
            last.unwrap()
        };
        assert_eq!(oldest.project_name, "2");
    }

    #[test]
    fn undo_redo_mirror() {
        let mut history = HistoryManager::default();
        history.record("k", Instant::now(), || named("before"));

        let restored = history.undo(named("after")).unwrap();
        assert_eq!(restored.project_name, "before");
        assert!(history.can_redo());

        let again = history.redo(named("before")).unwrap();
        assert_eq!(again.project_name, "after");
        assert!(history.can_undo());
        assert!(!history.can_redo());
    }

    #[test]
    fn new_push_clears_future() {
        let mut history = HistoryManager::default();
        let t0 = Instant::now();
        history.record("k", t0, || named("a"));
        history.undo(named("b"));
        assert_eq!(history.future_len(), 1);

        history.record("k", t0, || named("c"));
        assert_eq!(history.future_len(), 0);
    }

    #[test]
    fn empty_stacks_return_none() {
        let mut history = HistoryManager::default();
        assert!(history.undo(named("x")).is_none());
        assert!(history.redo(named("x")).is_none());
    }
}
