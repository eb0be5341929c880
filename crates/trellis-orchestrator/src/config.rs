//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) is valid.
//!
//! ```toml
//! [generation]
//! default_model = "echo:default"
//! temperature = 0.4
//!
//! [graph]
//! history_capacity = 100
//!
//! [build]
//! direction = "children"
//! max_depth = 2
//! ```

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use trellis_graph::{BuildConfig, GraphConfig};

/// Generation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Model id used when a request names none (`provider:model`)
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Model for one-sentence summaries; falls back to the generating model
    pub summary_model: Option<String>,
    pub summary_max_tokens: u32,
    /// Buffered frames per stream before slow subscribers lag
    pub stream_capacity: usize,
    /// Commands queued on the bus before senders wait
    pub dispatcher_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_model: "echo:default".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            summary_model: None,
            summary_max_tokens: 60,
            stream_capacity: 256,
            dispatcher_capacity: 64,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub generation: GenerationConfig,
    pub graph: GraphConfig,
    pub build: BuildConfig,
}

impl EngineConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// `OrchestratorError::Config` for malformed TOML or out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `OrchestratorError::Config` if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// `OrchestratorError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(OrchestratorError::Config(msg.to_string()));
        let generation = &self.generation;

        if !(0.0..=2.0).contains(&generation.temperature) {
            return fail("generation.temperature must be within 0.0..=2.0");
        }
        if generation.max_tokens == 0 {
            return fail("generation.max_tokens must be positive");
        }
        if generation.summary_max_tokens == 0 {
            return fail("generation.summary_max_tokens must be positive");
        }
        if generation.stream_capacity == 0 {
            return fail("generation.stream_capacity must be positive");
        }
        if generation.dispatcher_capacity == 0 {
            return fail("generation.dispatcher_capacity must be positive");
        }
        if generation.default_model.trim().is_empty() {
            return fail("generation.default_model must not be empty");
        }
        if self.graph.history_capacity == 0 {
            return fail("graph.history_capacity must be positive");
        }
        Ok(())
    }

    /// Graph settings with the build defaults folded in
    #[must_use]
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            build: self.build,
            ..self.graph.clone()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.generation.default_model = model.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.generation.summary_model = Some(model.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.generation.max_tokens = max_tokens;
        self
    }
}
