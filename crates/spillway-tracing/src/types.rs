//! Trace data types.
//!
//! A `Trace` is the bounded record of one control-loop run: a header
//! describing the input, an append-only sequence of `TraceStep`s, and a
//! terminal outcome. Steps attach arbitrary serializable data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifying information captured when a trace starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceHeader {
    /// Session the run belongs to.
    pub session_id: String,
    /// Tool whose output is being processed (e.g. "bash", "rlm_manual").
    pub tool_id: String,
    /// Estimated token count of the input payload.
    pub input_tokens: u64,
    /// Content classification of the input ("code", "logs", ...).
    pub content_class: String,
}

/// The kind of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Initial canned exploration of the context.
    Exploration,
    /// One turn of the root model.
    Iteration,
    /// A code block executed in the REPL.
    CodeExec,
    /// A sub-model call issued from inside the sandbox.
    Subcall,
    /// The final answer was captured.
    Final,
    /// A recoverable failure (timeout, model error, ...).
    Error,
}

impl StepKind {
    /// Short text tag used by the formatter.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Exploration => "explore",
            Self::Iteration => "iterate",
            Self::CodeExec => "exec",
            Self::Subcall => "subcall",
            Self::Final => "final",
            Self::Error => "error",
        }
    }
}

/// A single recorded step within a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// What happened.
    pub kind: StepKind,
    /// Iteration index this step belongs to, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Wall-clock time of the step (epoch milliseconds).
    pub wall_time_ms: u64,
    /// Milliseconds elapsed since the trace started.
    pub elapsed_ms: u64,
    /// Step-specific data.
    pub data: serde_json::Value,
}

/// A complete record of one control-loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Unique identifier for this trace.
    pub id: String,
    /// Header captured at start.
    #[serde(flatten)]
    pub header: TraceHeader,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Recorded steps, in wall-clock order.
    pub steps: Vec<TraceStep>,
    /// The final answer, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    /// Terminal error, when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    /// Create a new trace with a random id.
    pub fn new(header: TraceHeader) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            header,
            started_at: Utc::now(),
            ended_at: None,
            steps: Vec::new(),
            final_answer: None,
            error: None,
        }
    }

    /// Append a step, stamping wall time and elapsed offset.
    pub fn record(&mut self, kind: StepKind, data: serde_json::Value, iteration: Option<u32>) {
        let now = Utc::now();
        self.steps.push(TraceStep {
            kind,
            iteration,
            wall_time_ms: now.timestamp_millis().max(0) as u64,
            elapsed_ms: (now - self.started_at).num_milliseconds().max(0) as u64,
            data,
        });
    }

    /// Mark the trace complete with a final answer.
    pub fn complete_ok(&mut self, final_answer: impl Into<String>) {
        self.ended_at = Some(Utc::now());
        self.final_answer = Some(final_answer.into());
    }

    /// Mark the trace complete with an error.
    pub fn complete_error(&mut self, error: impl Into<String>) {
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Whether the run ended without a terminal error.
    pub fn is_success(&self) -> bool {
        self.ended_at.is_some() && self.error.is_none()
    }

    /// Total duration, if the trace has ended.
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}
