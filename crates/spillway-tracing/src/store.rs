//! Bounded in-process trace store.
//!
//! Traces are kept in insertion order (which matches `started_at` order) in a
//! ring of fixed capacity; inserting at capacity evicts the oldest trace.
//! The store is only touched from the host's event loop, so the mutex exists
//! for `Send` soundness rather than contention.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{StepKind, Trace, TraceHeader};

/// Maximum number of traces retained in memory.
pub const TRACE_CAPACITY: usize = 20;

/// Bounded store of recent traces.
#[derive(Debug)]
pub struct TraceStore {
    traces: Mutex<VecDeque<Trace>>,
    capacity: usize,
}

impl TraceStore {
    /// Create a store with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(TRACE_CAPACITY)
    }

    /// Create a store with a specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            traces: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Start a new trace and return its id.
    ///
    /// Evicts the oldest trace when the store is at capacity.
    pub fn start(&self, header: TraceHeader) -> String {
        let trace = Trace::new(header);
        let id = trace.id.clone();
        let mut traces = self.lock();
        if traces.len() >= self.capacity {
            traces.pop_front();
        }
        traces.push_back(trace);
        id
    }

    /// Record a step on an open trace. Unknown ids are ignored.
    pub fn step(&self, id: &str, kind: StepKind, data: serde_json::Value) {
        self.step_at(id, kind, data, None);
    }

    /// Record a step tagged with its iteration index.
    pub fn step_at(&self, id: &str, kind: StepKind, data: serde_json::Value, iteration: Option<u32>) {
        let mut traces = self.lock();
        if let Some(trace) = traces.iter_mut().find(|t| t.id == id) {
            trace.record(kind, data, iteration);
        }
    }

    /// End a trace with a final answer.
    pub fn end_ok(&self, id: &str, final_answer: impl Into<String>) {
        let mut traces = self.lock();
        if let Some(trace) = traces.iter_mut().find(|t| t.id == id) {
            trace.complete_ok(final_answer);
        }
    }

    /// End a trace with an error.
    pub fn end_error(&self, id: &str, error: impl Into<String>) {
        let mut traces = self.lock();
        if let Some(trace) = traces.iter_mut().find(|t| t.id == id) {
            trace.complete_error(error);
        }
    }

    /// Fetch a trace by id.
    pub fn get(&self, id: &str) -> Option<Trace> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    /// Most recent traces for a session, newest first.
    pub fn for_session(&self, session_id: &str, limit: usize) -> Vec<Trace> {
        self.lock()
            .iter()
            .rev()
            .filter(|t| t.header.session_id == session_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of traces currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop all traces.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Trace>> {
        // Poisoning only happens if a panic occurred mid-mutation; the data
        // is still structurally valid for our append-only usage.
        self.traces.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}
