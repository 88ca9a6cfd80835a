//! Host-supplied interfaces.
//!
//! The runtime never talks to a model provider directly. The embedding host
//! hands it a [`ModelProvider`] that resolves `provider:model` references to
//! opaque [`LanguageModel`] callables, plus an [`AbortSignal`] checked at
//! every suspension point. Mock implementations for deterministic tests live
//! here as well.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, RlmError};

// ============================================================================
// Abort Signal
// ============================================================================

/// Handle used by the host to trigger cancellation.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Signal all associated [`AbortSignal`]s.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative cancellation signal.
///
/// Cloned freely; every clone observes the same abort. A signal created with
/// [`AbortSignal::none`] never fires.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for signals created via `none()`.
    _tx: Option<Arc<watch::Sender<bool>>>,
}

impl AbortSignal {
    /// Create a connected handle/signal pair.
    pub fn new() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            AbortHandle { tx: Arc::clone(&tx) },
            AbortSignal { rx, _tx: Some(tx) },
        )
    }

    /// A signal that never fires.
    pub fn none() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        AbortSignal {
            rx,
            _tx: Some(Arc::new(tx)),
        }
    }

    /// Whether the abort has fired.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the abort fires; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without aborting: this signal can never fire.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Error if the abort has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(RlmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Conversation & Requests
// ============================================================================

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of the control-loop conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A request to a host-supplied language model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Conversation so far, oldest first.
    pub messages: Vec<ConversationTurn>,
    /// Upper bound on generated tokens.
    pub max_output_tokens: u32,
    /// Cancellation signal the model call must respect.
    pub abort: AbortSignal,
}

impl ModelRequest {
    /// Build a request from a message list.
    pub fn new(messages: Vec<ConversationTurn>, max_output_tokens: u32) -> Self {
        Self {
            messages,
            max_output_tokens,
            abort: AbortSignal::none(),
        }
    }

    /// Build a single-turn request from a bare prompt.
    pub fn from_prompt(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self::new(vec![ConversationTurn::user(prompt)], max_output_tokens)
    }

    /// Attach an abort signal.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }
}

/// A response from a host-supplied language model.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// Generated text.
    pub text: String,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

// ============================================================================
// Model Traits
// ============================================================================

/// An opaque language-model callable supplied by the host.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Execute a completion request.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse>;

    /// Name for logging.
    fn name(&self) -> &str {
        "model"
    }
}

/// Thread-safe model reference.
pub type SharedModel = Arc<dyn LanguageModel>;

/// Resolves `provider:model` references to callables.
pub trait ModelProvider: Send + Sync {
    /// Look up a model by reference.
    ///
    /// Returns [`RlmError::ModelCall`] when the provider has no such model;
    /// reference syntax is validated by the caller via [`parse_model_ref`].
    fn get(&self, reference: &str) -> Result<SharedModel>;
}

/// Split a `provider:model` reference into its parts.
///
/// Rejects references without a colon or with an empty side.
pub fn parse_model_ref(reference: &str) -> Result<(&str, &str)> {
    match reference.split_once(':') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(RlmError::Config(format!(
            "malformed model reference '{reference}' (expected provider:model)"
        ))),
    }
}

// ============================================================================
// Retry Helper
// ============================================================================

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors per [`RlmError::is_retryable`];
/// non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        label,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| RlmError::ModelCall(format!("{label}: retries exhausted"))))
}

// ============================================================================
// Mocks
// ============================================================================

/// A scripted model for testing.
///
/// Outcomes are returned in order; requests beyond the script fail. All
/// requests are logged for inspection.
pub struct MockModel {
    outcomes: Mutex<Vec<Result<ModelResponse>>>,
    request_log: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    /// Create a mock returning the given responses in order.
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self::with_outcomes(responses.into_iter().map(Ok).collect())
    }

    /// Create a mock with explicit per-call outcomes (for retry tests).
    pub fn with_outcomes(outcomes: Vec<Result<ModelResponse>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![ModelResponse::text(text)])
    }

    /// All requests made so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.request_log.lock().unwrap().clone()
    }

    /// Number of requests made so far.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse> {
        request.abort.check()?;
        self.request_log.lock().unwrap().push(request);

        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return Err(RlmError::ModelCall(
                "MockModel: no more responses available".to_string(),
            ));
        }
        outcomes.remove(0)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A provider that hands out the same model for every reference.
pub struct StaticProvider {
    model: SharedModel,
}

impl StaticProvider {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

impl ModelProvider for StaticProvider {
    fn get(&self, _reference: &str) -> Result<SharedModel> {
        Ok(Arc::clone(&self.model))
    }
}

/// A provider with no models, for exercising the unavailable path.
pub struct EmptyProvider;

impl ModelProvider for EmptyProvider {
    fn get(&self, reference: &str) -> Result<SharedModel> {
        Err(RlmError::ModelCall(format!("no model for '{reference}'")))
    }
}
