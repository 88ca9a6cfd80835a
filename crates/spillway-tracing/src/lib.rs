//! In-memory execution tracing for RLM runs.
//!
//! This crate records what the recursive control loop actually did:
//!
//! - **Types**: `Trace`, `TraceStep`, and `StepKind` structures
//! - **Store**: bounded in-process ring (`TraceStore`) with oldest-first eviction
//! - **Format**: compact operator-readable rendering of a trace
//!
//! Traces are deliberately ephemeral. The store holds at most a fixed number
//! of traces in process memory and never touches disk; durable persistence is
//! the host's concern.
//!
//! # Usage
//!
//! ```rust
//! use spillway_tracing::{StepKind, TraceHeader, TraceStore};
//!
//! let store = TraceStore::new();
//! let id = store.start(TraceHeader {
//!     session_id: "sess_1".to_string(),
//!     tool_id: "bash".to_string(),
//!     input_tokens: 12_000,
//!     content_class: "logs".to_string(),
//! });
//!
//! store.step(&id, StepKind::Exploration, serde_json::json!({"lines": 1200}));
//! store.end_ok(&id, "the answer");
//!
//! let trace = store.get(&id).unwrap();
//! assert_eq!(trace.steps.len(), 1);
//! ```

pub mod format;
pub mod store;
pub mod types;

pub use format::format_trace;
pub use store::{TRACE_CAPACITY, TraceStore};
pub use types::{StepKind, Trace, TraceHeader, TraceStep};
