//! Deterministic structural fallbacks.
//!
//! Two degradation paths live here:
//!
//! - [`smart_truncate`]: head/tail truncation with an explicit omission
//!   marker, used when the control loop never ran.
//! - [`build_enhanced_fallback`]: a structured extraction of file paths,
//!   tool calls, and errors, used when the loop ran but produced an answer
//!   the quality gate rejected.
//!
//! Both are pure functions of their inputs so a failed run is reproducible.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::tokens::{chars_for_tokens, estimate_tokens};

/// Default token budget for smart truncation.
pub const SMART_TRUNCATE_BUDGET: u64 = 8000;

/// Share of the budget spent on the head of the output.
const HEAD_SHARE: f64 = 0.6;
/// Share of the budget spent on the tail of the output.
const TAIL_SHARE: f64 = 0.3;

/// Result of a smart truncation.
#[derive(Debug, Clone)]
pub struct TruncateResult {
    pub content: String,
    pub was_truncated: bool,
    pub original_tokens: u64,
}

/// Head/tail truncation under a token budget.
///
/// Output within budget is returned unchanged. Otherwise the result is 60%
/// of the budget from the head, a marker line counting omitted tokens, a
/// tool-specific hint, and 30% from the tail.
pub fn smart_truncate(
    output: &str,
    tool_id: &str,
    tool_args: &serde_json::Value,
    max_tokens: u64,
) -> TruncateResult {
    let original_tokens = estimate_tokens(output);
    if original_tokens <= max_tokens {
        return TruncateResult {
            content: output.to_string(),
            was_truncated: false,
            original_tokens,
        };
    }

    let head_chars = chars_for_tokens((max_tokens as f64 * HEAD_SHARE) as u64);
    let tail_chars = chars_for_tokens((max_tokens as f64 * TAIL_SHARE) as u64);

    let head = take_chars(output, head_chars);
    let tail = take_last_chars(output, tail_chars);
    let omitted = original_tokens.saturating_sub(estimate_tokens(head) + estimate_tokens(tail));

    let content = format!(
        "{head}\n\n[... ~{omitted} tokens omitted ...]\n{}\n\n{tail}",
        rlm_hint(tool_id, tool_args)
    );

    TruncateResult {
        content,
        was_truncated: true,
        original_tokens,
    }
}

/// Tool-specific pointer at the RLM for the full payload.
fn rlm_hint(tool_id: &str, tool_args: &serde_json::Value) -> String {
    let arg = |key: &str| {
        tool_args
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    match tool_id {
        "read" => {
            let path = arg("filePath");
            format!("[Use the rlm tool to analyze the full file {path}]")
        }
        "bash" => {
            let command = arg("command");
            format!("[Use the rlm tool to analyze the full output of `{command}`]")
        }
        "grep" => {
            let pattern = arg("pattern");
            format!("[Use the rlm tool to analyze all matches for `{pattern}`]")
        }
        "glob" => "[Use the rlm tool to analyze the full file listing]".to_string(),
        _ => "[Use the rlm tool to analyze the full content]".to_string(),
    }
}

fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn take_last_chars(s: &str, n: usize) -> &str {
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    match s.char_indices().nth(total - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ============================================================================
// Enhanced Fallback
// ============================================================================

const MAX_FILE_PATHS: usize = 15;
const MAX_TOOL_CALLS: usize = 10;
const MAX_ERROR_LINES: usize = 5;
const REQUEST_HEAD_LINES: usize = 30;
const ACTIVITY_TAIL_LINES: usize = 80;

static FILE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w./@-]+\.(ts|tsx|js|jsx|py|rs|go|json|md|css|html)\b").expect("invalid pattern")
});
static TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Tool (\w+)\]").expect("invalid pattern"));
static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|failed").expect("invalid pattern"));

/// Structural summarization for answers the quality gate rejected.
///
/// Session context gets a full structured briefing; other tools get the
/// smart-truncated body under a fallback banner.
pub fn build_enhanced_fallback(
    output: &str,
    tool_id: &str,
    tool_args: &serde_json::Value,
    input_tokens: u64,
) -> String {
    if tool_id == "session_context" {
        session_context_fallback(output, input_tokens)
    } else {
        let truncated = smart_truncate(output, tool_id, tool_args, SMART_TRUNCATE_BUDGET);
        format!(
            "## Fallback Summary\n\nStructural truncation of {input_tokens} tokens of `{tool_id}` output; model analysis was unavailable or rejected.\n\n{}",
            truncated.content
        )
    }
}

fn session_context_fallback(output: &str, input_tokens: u64) -> String {
    let lines: Vec<&str> = output.lines().collect();

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for m in FILE_PATH_RE.find_iter(output) {
        if seen.insert(m.as_str().to_string()) {
            files.push(m.as_str().to_string());
            if files.len() >= MAX_FILE_PATHS {
                break;
            }
        }
    }

    let mut seen_tools = HashSet::new();
    let mut tools = Vec::new();
    for cap in TOOL_CALL_RE.captures_iter(output) {
        let name = cap[1].to_string();
        if seen_tools.insert(name.clone()) {
            tools.push(name);
            if tools.len() >= MAX_TOOL_CALLS {
                break;
            }
        }
    }

    let errors: Vec<&str> = lines
        .iter()
        .rev()
        .filter(|l| ERROR_LINE_RE.is_match(l))
        .take(MAX_ERROR_LINES)
        .copied()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let head = lines[..lines.len().min(REQUEST_HEAD_LINES)].join("\n");
    let tail_start = lines.len().saturating_sub(ACTIVITY_TAIL_LINES);
    let tail = lines[tail_start..].join("\n");

    let mut out = String::new();
    out.push_str("## Context Summary (Fallback Mode)\n\n");
    out.push_str(&format!(
        "Structural summary of {input_tokens} tokens of session context; model analysis was unavailable or rejected.\n\n"
    ));

    if !files.is_empty() {
        out.push_str("**Files Modified**\n\n");
        for f in &files {
            out.push_str(&format!("- `{f}`\n"));
        }
        out.push('\n');
    }

    if !tools.is_empty() {
        out.push_str("**Recent Tool Calls**\n\n");
        for t in &tools {
            out.push_str(&format!("- {t}\n"));
        }
        out.push('\n');
    }

    if !errors.is_empty() {
        out.push_str("**Recent Errors**\n\n");
        for e in &errors {
            out.push_str(&format!("- {}\n", e.trim()));
        }
        out.push('\n');
    }

    out.push_str("### Initial Request\n\n```\n");
    out.push_str(&head);
    out.push_str("\n```\n\n### Recent Activity\n\n```\n");
    out.push_str(&tail);
    out.push_str("\n```\n");

    out
}
