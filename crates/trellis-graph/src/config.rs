//! Graph configuration

use crate::scope::Direction;
use crate::types::Point;
use serde::{Deserialize, Serialize};

/// Tunables for the synchronous graph core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum undo (and redo) depth
    pub history_capacity: usize,
    /// Same-key mutations inside this window share one undo step
    pub coalesce_window_ms: u64,
    /// Characters of a parent prompt used as a branch label in context
    pub branch_label_chars: usize,
    /// Characters of an unpinned artifact response shown in context
    pub artifact_preview_chars: usize,
    /// Placement of a new child relative to its parent
    pub child_offset: Point,
    /// Build session defaults
    pub build: BuildConfig,
}

impl GraphConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_coalesce_window_ms(mut self, window_ms: u64) -> Self {
        self.coalesce_window_ms = window_ms;
        self
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            history_capacity: 50,
            coalesce_window_ms: 750,
            branch_label_chars: 30,
            artifact_preview_chars: 600,
            child_offset: Point::new(40.0, 160.0),
            build: BuildConfig::default(),
        }
    }
}

/// Build session defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub direction: Direction,
    pub max_depth: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Both,
            max_depth: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GraphConfig::default();
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.coalesce_window_ms, 750);
        assert_eq!(config.branch_label_chars, 30);
        assert_eq!(config.artifact_preview_chars, 600);
        assert_eq!(config.build.max_depth, 3);
        assert_eq!(config.build.direction, Direction::Both);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: GraphConfig = serde_json::from_str(r#"{"history_capacity": 5}"#).unwrap();
        assert_eq!(config.history_capacity, 5);
        assert_eq!(config.coalesce_window_ms, 750);
    }
}
