//! Prompt assembly for the control loop.
//!
//! Two prompt families, parameterized by REPL runtime and content
//! classification: the first-iteration system prompt that teaches the root
//! model its environment, and the short continuation prompt for later
//! iterations. The task-query builder turns a tool id and its arguments into
//! the analysis objective.

use crate::chunker::{ContentClass, processing_hints};
use crate::repl::Runtime;

/// Characters of previous output shown in the continuation prompt.
const CONTINUATION_PREVIEW_CHARS: usize = 2000;

/// Whether a tool's task query already carries full instructions and must
/// not be wrapped in the first-iteration boilerplate.
pub fn is_self_contained(tool_id: &str) -> bool {
    tool_id == "session_context"
}

/// One-line (or, for session context, fully self-contained) analysis
/// objective for a tool's output.
pub fn task_query(tool_id: &str, tool_args: &serde_json::Value) -> String {
    let arg = |key: &str| tool_args.get(key).and_then(|v| v.as_str()).unwrap_or("");

    match tool_id {
        "read" => {
            let path = arg("filePath");
            format!(
                "Summarize the file {path}: its purpose, key structures and functions, and anything surprising."
            )
        }
        "bash" => {
            let command = arg("command");
            format!(
                "Summarize the output of `{command}`: key results, errors, and anomalies worth acting on."
            )
        }
        "grep" => {
            let pattern = arg("pattern");
            format!(
                "Summarize the search matches for `{pattern}`: group them by file and explain what each group means."
            )
        }
        "glob" => {
            "Summarize this file listing: overall structure, notable files, and how the project is organized."
                .to_string()
        }
        "session_context" => SESSION_CONTEXT_QUERY.to_string(),
        "rlm_manual" => {
            let query = arg("query");
            if query.is_empty() {
                "Summarize this content.".to_string()
            } else {
                query.to_string()
            }
        }
        _ => "Summarize this content.".to_string(),
    }
}

/// Self-contained briefing instructions for session-context compaction.
/// Deliberately not wrapped by the first-iteration boilerplate.
const SESSION_CONTEXT_QUERY: &str = r#"Produce a comprehensive briefing of this coding session for an agent that is about to take over. The context variable holds the full session transcript.

The briefing MUST cover, in order:
1. Goal - what the user is ultimately trying to accomplish
2. Current state - what has been done so far and what works
3. Last actions - the most recent commands, edits, and their results
4. Active files - every file being read or modified, as literal paths
5. Pending tasks - what remains, including anything the user asked for that has not happened yet
6. Next steps - the concrete actions the next agent should take first

Generic summaries are useless here. Quote literal file paths, function names, and error messages from the transcript. If a test failed, include the failing assertion. If a command errored, include the error line."#;

/// First-iteration system prompt: environment, helpers, cost guidance, the
/// task, and two worked strategies in the runtime's language.
pub fn system_prompt(
    runtime: Runtime,
    context_chars: usize,
    context_lines: usize,
    class: ContentClass,
    task: &str,
) -> String {
    let lang = runtime.fence_tag();
    let (strategy_a, strategy_b) = strategies(runtime);

    format!(
        r#"You are analyzing a payload too large to read directly. You are driving a {lang} REPL that holds the payload, and you work by writing code against it.

The variable `context` is preloaded with the full input: {context_chars} characters across {context_lines} lines. Content shape: {class} ({hints}).

The environment provides:
- `sub_query(prompt, output)` - ask a sub-model to analyze a piece of text; returns its answer
- `lines()`, `head(n)`, `tail(n)` - line access
- `grep(pattern)`, `count(pattern)` - regex filtering over lines
- `chunk(n)` - split the context into n roughly equal pieces
- `FINAL(answer)` - emit your final answer and stop
- `FINAL_VAR(name)` - emit the value of the named variable as the final answer

Sub-queries are expensive. Batch aggressively: put 100-200k characters into each call and aim for 5-10 sub-queries per 1000 lines, never one per line.

Write code in fenced blocks tagged `{lang}`. Each block executes in the REPL and its printed output comes back to you. Iterate until you can call FINAL.

Task: {task}

Two strategies that work well:

Strategy A - chunk and summarize:
```{lang}
{strategy_a}
```

Strategy B - filter first, then summarize:
```{lang}
{strategy_b}
```"#,
        hints = processing_hints(class),
    )
}

/// Short continuation prompt for iterations after the first.
pub fn continuation_prompt(previous_output: &str) -> String {
    let preview: String = previous_output
        .chars()
        .take(CONTINUATION_PREVIEW_CHARS)
        .collect();
    let truncated = if previous_output.chars().count() > CONTINUATION_PREVIEW_CHARS {
        "\n[output truncated]"
    } else {
        ""
    };

    format!(
        "Continue the analysis. Output of your last code block:\n\n{preview}{truncated}\n\nRun more code, or call FINAL(answer) / FINAL_VAR(name) when you have the answer."
    )
}

/// Canned exploration block executed before the first model turn.
pub fn exploration_code(runtime: Runtime) -> &'static str {
    match runtime.fence_tag() {
        "go" => GO_EXPLORATION,
        _ => PYTHON_EXPLORATION,
    }
}

const PYTHON_EXPLORATION: &str = r#"print("chars:", len(context))
print("lines:", len(context.splitlines()))
print("--- first 1500 chars ---")
print(context[:1500])
print("--- last 1500 chars ---")
print(context[-1500:])"#;

const GO_EXPLORATION: &str = r#"n := len(context)
a := 1500
if n < a {
    a = n
}
fmt.Println("chars:", n)
fmt.Println("lines:", len(lines()))
fmt.Println("--- first 1500 chars ---")
fmt.Println(context[:a])
fmt.Println("--- last 1500 chars ---")
fmt.Println(context[n-a:])"#;

fn strategies(runtime: Runtime) -> (&'static str, &'static str) {
    match runtime.fence_tag() {
        "go" => (GO_STRATEGY_A, GO_STRATEGY_B),
        _ => (PYTHON_STRATEGY_A, PYTHON_STRATEGY_B),
    }
}

const PYTHON_STRATEGY_A: &str = r#"summaries = []
for piece in chunk(8):
    summaries.append(sub_query("Summarize the key facts in this section.", piece))
combined = "\n".join(summaries)
answer = sub_query("Merge these section summaries into one coherent answer.", combined)
FINAL(answer)"#;

const PYTHON_STRATEGY_B: &str = r#"hits = grep("(?i)error|warn|fail")
relevant = "\n".join(hits)
answer = sub_query("Explain what went wrong based on these log lines.", relevant)
FINAL(answer)"#;

const GO_STRATEGY_A: &str = r#"var summaries []string
for _, piece := range chunk(8) {
    summaries = append(summaries, sub_query("Summarize the key facts in this section.", piece))
}
combined := strings.Join(summaries, "\n")
FINAL(sub_query("Merge these section summaries into one coherent answer.", combined))"#;

const GO_STRATEGY_B: &str = r#"hits := grep("(?i)error|warn|fail")
relevant := strings.Join(hits, "\n")
FINAL(sub_query("Explain what went wrong based on these log lines.", relevant))"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_query_per_tool() {
        let q = task_query("read", &serde_json::json!({"filePath": "src/main.rs"}));
        assert!(q.contains("src/main.rs"));

        let q = task_query("bash", &serde_json::json!({"command": "cargo test"}));
        assert!(q.contains("cargo test"));

        let q = task_query("grep", &serde_json::json!({"pattern": "unwrap"}));
        assert!(q.contains("unwrap"));

        let q = task_query("glob", &serde_json::json!({}));
        assert!(q.contains("listing"));
    }

    #[test]
    fn test_session_context_is_self_contained() {
        assert!(is_self_contained("session_context"));
        assert!(!is_self_contained("read"));

        let q = task_query("session_context", &serde_json::json!({}));
        assert!(q.contains("literal file paths"));
        assert!(q.contains("Goal"));
        assert!(q.contains("Next steps"));
    }

    #[test]
    fn test_manual_query_passes_through() {
        let q = task_query("rlm_manual", &serde_json::json!({"query": "find the auth bug"}));
        assert_eq!(q, "find the auth bug");
    }

    #[test]
    fn test_system_prompt_names_environment() {
        let prompt = system_prompt(
            Runtime::ScriptingFast,
            100_000,
            2500,
            ContentClass::Logs,
            "Summarize the output.",
        );

        assert!(prompt.contains("100000 characters"));
        assert!(prompt.contains("2500 lines"));
        assert!(prompt.contains("sub_query"));
        assert!(prompt.contains("FINAL_VAR"));
        assert!(prompt.contains("Summarize the output."));
        assert!(prompt.contains("```python"));
        assert!(prompt.contains("100-200k characters"));
    }

    #[test]
    fn test_system_prompt_switches_language() {
        let prompt = system_prompt(
            Runtime::Compiled,
            1000,
            20,
            ContentClass::Code,
            "task",
        );
        assert!(prompt.contains("```go"));
        assert!(prompt.contains("strings.Join"));
        assert!(!prompt.contains("```python"));
    }

    #[test]
    fn test_continuation_prompt_truncates() {
        let long = "y".repeat(5000);
        let prompt = continuation_prompt(&long);
        assert!(prompt.contains("[output truncated]"));
        assert!(prompt.chars().count() < 2500);

        let short = continuation_prompt("brief output");
        assert!(short.contains("brief output"));
        assert!(!short.contains("[output truncated]"));
    }

    #[test]
    fn test_exploration_code_prints_extent() {
        let py = exploration_code(Runtime::ScriptingDefault);
        assert!(py.contains("1500"));
        assert!(py.contains("context"));

        let go = exploration_code(Runtime::Compiled);
        assert!(go.contains("1500"));
    }
}
