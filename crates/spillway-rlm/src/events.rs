//! Event bus and wire-level event payloads.
//!
//! The runtime publishes typed, serializable events to a host-supplied sink.
//! It never subscribes and stores no bus state, so multiple runtimes can
//! share one process safely. Publication order preserves causal order per
//! session.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Event names published by the runtime.
pub mod topics {
    /// Routing verdict for a tool output.
    pub const ROUTING_DECISION: &str = "rlm.routing.decision";
    /// One sub-model call issued from the sandbox.
    pub const SUBCALL: &str = "rlm.subcall";
    /// One root-model iteration finished.
    pub const ITERATION: &str = "rlm.iteration";
    /// A control-loop run finished.
    pub const COMPLETE: &str = "rlm.complete";
    /// A trace was opened.
    pub const TRACE_START: &str = "rlm.trace.start";
    /// A trace step was recorded.
    pub const TRACE_STEP: &str = "rlm.trace.step";
    /// A trace was finalized.
    pub const TRACE_END: &str = "rlm.trace.end";
}

/// Fire-and-forget event sink supplied by the host.
pub trait EventBus: Send + Sync {
    /// Publish an event. Must not block or fail.
    fn publish(&self, event: &str, payload: serde_json::Value);
}

/// Thread-safe bus reference.
pub type SharedBus = Arc<dyn EventBus>;

/// Serialize a payload and publish it; serialization failures are dropped.
pub fn publish<T: Serialize>(bus: &dyn EventBus, event: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        bus.publish(event, value);
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload for `rlm.routing.decision`.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecisionEvent {
    pub tool: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "callID", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// "routed" or "passthrough".
    pub decision: String,
    pub reason: String,
    #[serde(rename = "estimatedTokens")]
    pub estimated_tokens: u64,
    #[serde(rename = "contextLimit")]
    pub context_limit: u64,
    pub threshold: f64,
    pub mode: String,
}

/// Payload for `rlm.subcall`.
#[derive(Debug, Clone, Serialize)]
pub struct SubcallEvent {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "subcallNumber")]
    pub subcall_number: u32,
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "responseTokens")]
    pub response_tokens: u64,
}

/// Payload for `rlm.iteration`.
#[derive(Debug, Clone, Serialize)]
pub struct IterationEvent {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub iteration: u32,
    #[serde(rename = "maxIterations")]
    pub max_iterations: u32,
    #[serde(rename = "codeBlocksFound")]
    pub code_blocks_found: usize,
    #[serde(rename = "hasFinal")]
    pub has_final: bool,
}

/// Payload for `rlm.complete`.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteEvent {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    pub iterations: u32,
    pub subcalls: u32,
    /// Wall-clock duration of the run, milliseconds.
    #[serde(rename = "elapsed")]
    pub elapsed_ms: u64,
    #[serde(rename = "compressionRatio")]
    pub compression_ratio: f64,
}

/// Payload for `rlm.trace.start`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStartEvent {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub tool: String,
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "contentClass")]
    pub content_class: String,
}

/// Payload for `rlm.trace.step`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStepEvent {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// Payload for `rlm.trace.end`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEndEvent {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub success: bool,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

// ============================================================================
// Bus Implementations
// ============================================================================

/// A bus that drops everything.
#[derive(Debug, Default)]
pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _event: &str, _payload: serde_json::Value) {}
}

/// A bus that records events in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryBus {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all published events, in order.
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }

    /// Payloads published under a given event name, in order.
    pub fn of_kind(&self, event: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of events published under a given name.
    pub fn count(&self, event: &str) -> usize {
        self.of_kind(event).len()
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, event: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
    }
}
