//! Operator-readable trace rendering.
//!
//! Produces a compact plain-text log with per-step elapsed offsets, suitable
//! for inclusion in dashboards and terminal output.

use crate::types::{StepKind, Trace};

/// Render a trace as a compact human-readable log.
pub fn format_trace(trace: &Trace) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "trace {} [{}] session={} class={} input={} tokens\n",
        short_id(&trace.id),
        trace.header.tool_id,
        trace.header.session_id,
        trace.header.content_class,
        trace.header.input_tokens,
    ));

    for step in &trace.steps {
        let offset = format!("+{:>6.2}s", step.elapsed_ms as f64 / 1000.0);
        let label = match step.iteration {
            Some(i) => format!("{} #{}", step.kind.tag(), i),
            None => step.kind.tag().to_string(),
        };
        out.push_str(&format!("  {offset} {label:<12} {}\n", summarize(&step.data)));
    }

    match (&trace.ended_at, &trace.error) {
        (Some(_), Some(err)) => out.push_str(&format!(
            "ended in {:.1}s, error: {}\n",
            trace.duration_ms().unwrap_or(0) as f64 / 1000.0,
            err
        )),
        (Some(_), None) => out.push_str(&format!(
            "ended in {:.1}s, ok\n",
            trace.duration_ms().unwrap_or(0) as f64 / 1000.0
        )),
        (None, _) => out.push_str("still running\n"),
    }

    out
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Flatten a data payload into `key=value` pairs, truncating long strings.
fn summarize(data: &serde_json::Value) -> String {
    const MAX_VALUE_CHARS: usize = 60;

    match data {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => truncate(s, MAX_VALUE_CHARS),
                    other => other.to_string(),
                };
                format!("{k}={rendered}")
            })
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Null => String::new(),
        other => truncate(&other.to_string(), MAX_VALUE_CHARS),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Icon-free severity marker for a step kind, for UIs that column-align.
pub fn step_marker(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Exploration => ">",
        StepKind::Iteration => "-",
        StepKind::CodeExec => "$",
        StepKind::Subcall => "~",
        StepKind::Final => "=",
        StepKind::Error => "!",
    }
}
