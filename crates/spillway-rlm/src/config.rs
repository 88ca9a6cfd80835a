//! RLM runtime configuration.
//!
//! The host hands the runtime an [`RlmConfig`], typically deserialized from
//! its own config file. Every field has a default so a `[rlm]` section can be
//! partial or absent.

use serde::{Deserialize, Serialize};

use crate::repl::Runtime;
use crate::router::RoutingMode;

/// Default routing threshold as a fraction of the model context limit.
pub const DEFAULT_THRESHOLD: f64 = 0.35;
/// Default cap on root-model iterations per run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;
/// Default cap on sub-model calls per run.
pub const DEFAULT_MAX_SUBCALLS: u32 = 50;

/// Configuration recognized by the RLM runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RlmConfig {
    /// Routing mode: off, auto, or always.
    pub mode: RoutingMode,
    /// Fraction of the model context limit above which output is routed.
    pub threshold: f64,
    /// Preferred REPL runtime.
    pub runtime: Runtime,
    /// `provider:model` reference for the root model driving the loop.
    pub root_model: Option<String>,
    /// `provider:model` reference for sub-queries; falls back to `root_model`.
    pub subcall_model: Option<String>,
    /// Maximum root-model iterations per run.
    pub max_iterations: u32,
    /// Maximum sub-model calls per run.
    pub max_subcalls: u32,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Auto,
            threshold: DEFAULT_THRESHOLD,
            runtime: Runtime::ScriptingFast,
            root_model: None,
            subcall_model: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_subcalls: DEFAULT_MAX_SUBCALLS,
        }
    }
}

impl RlmConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the routing mode.
    pub fn with_mode(mut self, mode: RoutingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the routing threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the preferred runtime.
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Set the root model reference.
    pub fn with_root_model(mut self, reference: impl Into<String>) -> Self {
        self.root_model = Some(reference.into());
        self
    }

    /// Set the sub-call model reference.
    pub fn with_subcall_model(mut self, reference: impl Into<String>) -> Self {
        self.subcall_model = Some(reference.into());
        self
    }

    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the sub-call cap.
    pub fn with_max_subcalls(mut self, max: u32) -> Self {
        self.max_subcalls = max;
        self
    }

    /// The model reference used for sub-queries.
    pub fn subcall_model_ref(&self) -> Option<&str> {
        self.subcall_model.as_deref().or(self.root_model.as_deref())
    }
}
