//! Manual RLM invocation.
//!
//! `RlmTool` is the direct entry point hosts expose to agents: hand it a
//! query plus content (inline or by path) and it runs the full recursive
//! analysis. Small content bypasses the loop entirely; spawning a REPL to
//! analyze a few paragraphs costs more than it saves.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunker::ContentClass;
use crate::engine::{AutoProcessOptions, AutoProcessor};
use crate::error::{Result, RlmError};
use crate::host::AbortSignal;
use crate::tokens::estimate_tokens;

/// Content below this many tokens is returned unchanged.
pub const MIN_RLM_TOKENS: u64 = 10_000;

/// Tool id used for manual runs in events and traces.
pub const MANUAL_TOOL_ID: &str = "rlm_manual";

/// Requested content classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    #[default]
    Auto,
    Code,
    Documents,
    Logs,
    Conversation,
}

impl ContextType {
    /// The classification override this request implies, if any.
    pub fn as_class(self) -> Option<ContentClass> {
        match self {
            Self::Auto => None,
            Self::Code => Some(ContentClass::Code),
            Self::Documents => Some(ContentClass::Documents),
            Self::Logs => Some(ContentClass::Logs),
            Self::Conversation => Some(ContentClass::Conversation),
        }
    }
}

/// Parameters for a manual run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RlmToolParams {
    /// The analysis objective.
    pub query: String,
    /// Inline content to analyze.
    #[serde(default)]
    pub content: Option<String>,
    /// Files to read and concatenate as content.
    #[serde(default)]
    pub content_paths: Option<Vec<String>>,
    /// Classification override.
    #[serde(default)]
    pub context_type: Option<ContextType>,
}

/// Streamed progress updates for the host UI.
pub type MetadataFn = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Call context for a manual run.
#[derive(Clone)]
pub struct RlmToolContext {
    pub session_id: String,
    pub abort: AbortSignal,
    pub metadata: Option<MetadataFn>,
}

impl RlmToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            abort: AbortSignal::none(),
            metadata: None,
        }
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataFn) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn emit(&self, payload: serde_json::Value) {
        if let Some(f) = &self.metadata {
            f(payload);
        }
    }
}

/// The manual analysis tool.
pub struct RlmTool {
    engine: Arc<AutoProcessor>,
}

impl RlmTool {
    pub fn new(engine: Arc<AutoProcessor>) -> Self {
        Self { engine }
    }

    /// Run the analysis described by `params`.
    pub async fn execute(&self, params: RlmToolParams, ctx: RlmToolContext) -> Result<String> {
        let content = self.gather_content(&params).await?;
        let tokens = estimate_tokens(&content);

        if tokens < MIN_RLM_TOKENS {
            return Ok(format!(
                "Note: Content is only {tokens} tokens, below the {MIN_RLM_TOKENS} token threshold for RLM analysis. Returning it unchanged.\n\n{content}"
            ));
        }

        let mut opts = AutoProcessOptions::new(MANUAL_TOOL_ID, ctx.session_id.clone())
            .with_args(serde_json::json!({"query": params.query}))
            .with_abort(ctx.abort.clone());
        if let Some(class) = params.context_type.unwrap_or_default().as_class() {
            opts = opts.with_class(class);
        }

        let progress_ctx = ctx.clone();
        opts = opts.with_progress(Arc::new(move |status: &str| {
            progress_ctx.emit(serde_json::json!({"status": status}));
        }));

        let result = self.engine.auto_process(&content, &opts).await?;
        ctx.emit(serde_json::json!({
            "inputTokens": result.stats.input_tokens,
            "outputTokens": result.stats.output_tokens,
            "iterations": result.stats.iterations,
            "subcalls": result.stats.subcalls,
        }));

        Ok(result.processed)
    }

    /// Resolve inline content or read the given paths.
    async fn gather_content(&self, params: &RlmToolParams) -> Result<String> {
        if let Some(content) = &params.content {
            return Ok(content.clone());
        }

        let Some(paths) = params.content_paths.as_ref().filter(|p| !p.is_empty()) else {
            return Err(RlmError::Config(
                "rlm tool requires either content or contentPaths".to_string(),
            ));
        };

        let mut combined = String::new();
        for path in paths {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RlmError::Io(format!("{path}: {e}")))?;
            combined.push_str(&format!("=== {path} ===\n{text}\n"));
        }
        Ok(combined)
    }
}
