//! Line protocol shared by both REPL backends.
//!
//! The host frames code blocks with `CODE_START_<id>` / `CODE_END_<id>` on
//! the child's stdin; the child answers with `DONE_<id>` when the block
//! finishes. While executing, the child may interleave three in-band markers
//! with arbitrary stdout:
//!
//! - `LLM_REQUEST_START{json}LLM_REQUEST_END` - a sub-model request; the
//!   host must reply with a single `{"response": ...}` line on stdin
//! - `FINAL_<answer>_FINAL_END` - the final answer
//! - `FINAL_VAR_<name>_FINAL_VAR_END` - final answer by variable name
//!
//! [`MarkerScanner`] is an incremental framing state machine: feed it stdout
//! chunks as they arrive and it yields [`ProtocolEvent`]s, holding back
//! partial markers that straddle chunk boundaries. Plain output comes back
//! with the markers stripped.

use serde::Deserialize;

pub const CODE_START_PREFIX: &str = "CODE_START_";
pub const CODE_END_PREFIX: &str = "CODE_END_";
pub const DONE_PREFIX: &str = "DONE_";
pub const LLM_REQUEST_START: &str = "LLM_REQUEST_START";
pub const LLM_REQUEST_END: &str = "LLM_REQUEST_END";
pub const FINAL_PREFIX: &str = "FINAL_";
pub const FINAL_END: &str = "_FINAL_END";
pub const FINAL_VAR_PREFIX: &str = "FINAL_VAR_";
pub const FINAL_VAR_END: &str = "_FINAL_VAR_END";
/// Printed by the child once its context is installed.
pub const READY_BANNER_PREFIX: &str = "Context loaded:";

/// A sub-model request decoded from the in-band JSON frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubQueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub output: Option<String>,
}

/// One framed event from the child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Plain output with markers stripped.
    Output(String),
    /// The child wants a sub-model answer.
    SubQuery(SubQueryRequest),
    /// The child declared its final answer.
    Final(String),
    /// The child named a variable holding the final answer.
    FinalVar(String),
    /// The block with this id finished.
    Done(String),
}

/// Marker tokens that can open a frame. `FINAL_VAR_` is covered by the
/// `FINAL_` prefix during hold-back checks.
const START_TOKENS: &[&str] = &[LLM_REQUEST_START, FINAL_PREFIX, DONE_PREFIX];

/// Incremental scanner over child stdout.
#[derive(Debug, Default)]
pub struct MarkerScanner {
    buf: String,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout; returns the events it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<ProtocolEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some((pos, token)) = self.earliest_marker() else {
                // No marker: emit everything except a tail that could be the
                // start of one.
                let hold = held_back_len(&self.buf);
                if self.buf.len() > hold {
                    let emit: String = self.buf.drain(..self.buf.len() - hold).collect();
                    if !emit.is_empty() {
                        events.push(ProtocolEvent::Output(emit));
                    }
                }
                break;
            };

            if pos > 0 {
                let emit: String = self.buf.drain(..pos).collect();
                events.push(ProtocolEvent::Output(emit));
            }

            match self.consume_marker(token) {
                Some(event) => events.push(event),
                // Frame not complete yet; wait for more input.
                None => break,
            }
        }

        events
    }

    /// Emit whatever is still buffered as plain output.
    pub fn flush(&mut self) -> Option<ProtocolEvent> {
        if self.buf.is_empty() {
            None
        } else {
            Some(ProtocolEvent::Output(std::mem::take(&mut self.buf)))
        }
    }

    /// Earliest start-marker occurrence in the buffer.
    fn earliest_marker(&self) -> Option<(usize, &'static str)> {
        START_TOKENS
            .iter()
            .filter_map(|t| self.buf.find(t).map(|p| (p, *t)))
            .min_by_key(|(p, _)| *p)
    }

    /// Try to consume the marker at the head of the buffer. Returns `None`
    /// when the frame's terminator has not arrived yet.
    fn consume_marker(&mut self, token: &'static str) -> Option<ProtocolEvent> {
        match token {
            LLM_REQUEST_START => {
                let body_start = LLM_REQUEST_START.len();
                let end = self.buf[body_start..].find(LLM_REQUEST_END)?;
                let json = self.buf[body_start..body_start + end].to_string();
                self.buf.drain(..body_start + end + LLM_REQUEST_END.len());

                match serde_json::from_str::<SubQueryRequest>(&json) {
                    Ok(request) => Some(ProtocolEvent::SubQuery(request)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed sub-query frame; passing through");
                        Some(ProtocolEvent::Output(json))
                    }
                }
            }
            DONE_PREFIX => {
                let body_start = DONE_PREFIX.len();
                let nl = self.buf[body_start..].find('\n')?;
                let id = self.buf[body_start..body_start + nl]
                    .trim_end_matches('\r')
                    .to_string();
                self.buf.drain(..body_start + nl + 1);
                Some(ProtocolEvent::Done(id))
            }
            FINAL_PREFIX => {
                // Could still turn out to be FINAL_VAR_ once more bytes land.
                let rest = &self.buf[..];
                if rest.len() < FINAL_VAR_PREFIX.len() && FINAL_VAR_PREFIX.starts_with(rest) {
                    return None;
                }

                if rest.starts_with(FINAL_VAR_PREFIX) {
                    let body_start = FINAL_VAR_PREFIX.len();
                    let end = self.buf[body_start..].find(FINAL_VAR_END)?;
                    let name = self.buf[body_start..body_start + end].to_string();
                    self.buf.drain(..body_start + end + FINAL_VAR_END.len());
                    Some(ProtocolEvent::FinalVar(name))
                } else {
                    let body_start = FINAL_PREFIX.len();
                    let end = self.buf[body_start..].find(FINAL_END)?;
                    let answer = self.buf[body_start..body_start + end].to_string();
                    self.buf.drain(..body_start + end + FINAL_END.len());
                    Some(ProtocolEvent::Final(answer))
                }
            }
            _ => unreachable!("unknown marker token"),
        }
    }
}

/// Length of the buffer tail that is a proper prefix of some start token and
/// must be held back until more input arrives.
fn held_back_len(buf: &str) -> usize {
    let max_len = START_TOKENS.iter().map(|t| t.len()).max().unwrap_or(0);
    let tail_start = buf.len().saturating_sub(max_len);

    for start in tail_start..buf.len() {
        if !buf.is_char_boundary(start) {
            continue;
        }
        let tail = &buf[start..];
        if START_TOKENS.iter().any(|t| t.starts_with(tail)) {
            return buf.len() - start;
        }
    }
    0
}
