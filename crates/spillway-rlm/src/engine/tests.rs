use std::collections::HashMap;
use std::sync::Arc;

use super::*;
use crate::events::MemoryBus;
use crate::host::{AbortSignal, MockModel, ModelResponse, StaticProvider};
use crate::repl::probe_binary;

// ============================================================================
// Parsing Helpers
// ============================================================================

#[test]
fn test_extract_python_blocks() {
    let text = "Let me check.\n```python\nprint(1)\n```\nand then\n```\nprint(2)\n```";
    let blocks = extract_code_blocks(text, Runtime::ScriptingFast);
    assert_eq!(blocks, vec!["print(1)".to_string(), "print(2)".to_string()]);
}

#[test]
fn test_extract_skips_foreign_language_blocks() {
    let text = "```rust\nlet x = 1;\n```\n```python\nprint(1)\n```";
    let blocks = extract_code_blocks(text, Runtime::ScriptingFast);
    assert_eq!(blocks, vec!["print(1)".to_string()]);
}

#[test]
fn test_extract_go_blocks() {
    let text = "```go\nfmt.Println(1)\n```\n```py\nprint(1)\n```";
    let blocks = extract_code_blocks(text, Runtime::Compiled);
    assert_eq!(blocks, vec!["fmt.Println(1)".to_string()]);
}

#[test]
fn test_extract_preserves_textual_order() {
    let text = "```python\nfirst\n```\ntext\n```python\nsecond\n```";
    let blocks = extract_code_blocks(text, Runtime::ScriptingDefault);
    assert_eq!(blocks, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn test_textual_final_double_quotes() {
    let found = extract_textual_final("All done. FINAL(\"the answer\")");
    assert_eq!(found, Some(FinalAnswer::Text("the answer".to_string())));
}

#[test]
fn test_textual_final_single_quotes() {
    let found = extract_textual_final("FINAL('single')");
    assert_eq!(found, Some(FinalAnswer::Text("single".to_string())));
}

#[test]
fn test_textual_final_var() {
    let found = extract_textual_final("FINAL_VAR(summary)");
    assert_eq!(found, Some(FinalAnswer::Variable("summary".to_string())));
}

#[test]
fn test_textual_final_absent() {
    assert_eq!(extract_textual_final("nothing final here"), None);
}

#[test]
fn test_combine_output() {
    assert_eq!(combine_output("out", ""), "out");
    assert_eq!(combine_output("", "err"), "err");
    let both = combine_output("out", "err");
    assert!(both.contains("out") && both.contains("err") && both.contains("stderr"));
}

#[test]
fn test_clip() {
    assert_eq!(clip("short", 100), "short");
    let clipped = clip(&"x".repeat(200), 50);
    assert!(clipped.ends_with("[truncated]"));
}

// ============================================================================
// Engine Fixtures
// ============================================================================

struct MapProvider(HashMap<String, SharedModel>);

impl ModelProvider for MapProvider {
    fn get(&self, reference: &str) -> Result<SharedModel> {
        self.0
            .get(reference)
            .cloned()
            .ok_or_else(|| RlmError::ModelCall(format!("no model for '{reference}'")))
    }
}

fn make_deps(
    provider: Arc<dyn ModelProvider>,
    config: RlmConfig,
    dir: &std::path::Path,
) -> (AutoProcessor, Arc<MemoryBus>) {
    let bus = Arc::new(MemoryBus::new());
    let deps = EngineDeps {
        provider,
        bus: bus.clone(),
        traces: Arc::new(TraceStore::new()),
        pool: ReplPool::new(dir.to_path_buf()),
        config,
    };
    (AutoProcessor::new(deps), bus)
}

async fn python_present() -> bool {
    probe_binary("python3", "--version").await
}

// ============================================================================
// Degraded Paths (no REPL required)
// ============================================================================

#[tokio::test]
async fn test_no_root_model_returns_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StaticProvider::new(Arc::new(MockModel::with_text("x"))));
    let (engine, bus) = make_deps(provider, RlmConfig::default(), dir.path());

    let output = "log line\n".repeat(10_000);
    let opts = AutoProcessOptions::new("bash", "sess_1");
    let result = engine.auto_process(&output, &opts).await.unwrap();

    assert!(result.processed.starts_with("[RLM: "));
    assert!(result.processed.contains("[RLM skipped"));
    assert_eq!(result.stats.iterations, 0);
    assert_eq!(bus.count(topics::ITERATION), 0);
    assert_eq!(bus.count(topics::COMPLETE), 1);
}

#[tokio::test]
async fn test_malformed_model_ref_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StaticProvider::new(Arc::new(MockModel::with_text("x"))));
    let config = RlmConfig::new().with_root_model("no-colon-here");
    let (engine, _bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_1");
    let result = engine.auto_process("output", &opts).await;
    assert!(matches!(result, Err(RlmError::Config(_))));
}

#[tokio::test]
async fn test_provider_without_model_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MapProvider(HashMap::new()));
    let config = RlmConfig::new().with_root_model("anthropic:missing");
    let (engine, bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_1");
    let result = engine.auto_process(&"x".repeat(50_000), &opts).await.unwrap();

    assert!(result.processed.contains("[RLM skipped"));
    assert_eq!(bus.count(topics::ITERATION), 0);
}

#[tokio::test]
async fn test_abort_before_start_returns_best_effort() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StaticProvider::new(Arc::new(MockModel::with_text("x"))));
    let config = RlmConfig::new().with_root_model("mock:model");
    let (engine, bus) = make_deps(provider, config, dir.path());

    let (handle, abort) = AbortSignal::new();
    handle.abort();

    let opts = AutoProcessOptions::new("bash", "sess_1").with_abort(abort);
    let result = engine.auto_process(&"x".repeat(50_000), &opts).await.unwrap();

    assert!(result.processed.contains("RLM cancelled"));
    assert_eq!(bus.count(topics::ITERATION), 0);
    assert_eq!(bus.count(topics::SUBCALL), 0);
}

// ============================================================================
// Full Loop (requires python3)
// ============================================================================

#[tokio::test]
async fn test_final_captured_from_code_block() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::with_text(
        "I'll inspect it.\n```python\nprint('scanning')\nFINAL('answer-42')\n```",
    );
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_final");
    let result = engine
        .auto_process("a modest bash output to analyze", &opts)
        .await
        .unwrap();

    assert!(result.processed.contains("answer-42"));
    assert_eq!(result.stats.iterations, 1);

    let iterations = bus.of_kind(topics::ITERATION);
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0]["hasFinal"], true);

    let completes = bus.of_kind(topics::COMPLETE);
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0]["iterations"], 1);
}

#[tokio::test]
async fn test_subcall_cap_enforced() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();

    let root = MockModel::with_text(
        "```python\nfor i in range(5):\n    print(sub_query('question ' + str(i)))\nFINAL('capped')\n```",
    );
    let sub = MockModel::new(vec![
        ModelResponse::text("reply-0"),
        ModelResponse::text("reply-1"),
        ModelResponse::text("reply-2"),
    ]);
    let provider = Arc::new(MapProvider(HashMap::from([
        ("mock:root".to_string(), Arc::new(root) as SharedModel),
        ("mock:sub".to_string(), Arc::new(sub) as SharedModel),
    ])));

    let config = RlmConfig::new()
        .with_root_model("mock:root")
        .with_subcall_model("mock:sub")
        .with_max_subcalls(3);
    let (engine, bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_cap");
    let result = engine.auto_process("content", &opts).await.unwrap();

    assert!(result.processed.contains("capped"));
    assert_eq!(result.stats.subcalls, 3);

    let subcalls = bus.of_kind(topics::SUBCALL);
    assert_eq!(subcalls.len(), 3);
    for (i, event) in subcalls.iter().enumerate() {
        assert_eq!(event["subcallNumber"], (i + 1) as u64);
    }
}

#[tokio::test]
async fn test_refusal_answer_replaced_by_enhanced_fallback() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::with_text("FINAL(\"I do not have the previous context\")");
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, _bus) = make_deps(provider, config, dir.path());

    let mut transcript = String::from("user asked for a refactor of src/app/main.ts\n");
    transcript.push_str("[Tool edit] src/app/main.ts\n");
    transcript.push_str("Error: type mismatch in main.ts\n");

    let opts = AutoProcessOptions::new("session_context", "sess_refusal");
    let result = engine.auto_process(&transcript, &opts).await.unwrap();

    assert!(result.processed.contains("## Context Summary (Fallback Mode)"));
    assert!(result.processed.contains("Files Modified"));
    assert!(!result.processed.contains("I do not have the previous context"));
}

#[tokio::test]
async fn test_no_final_yields_marker_answer() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::new(vec![
        ModelResponse::text("Thinking about it, no code yet."),
        ModelResponse::text("Still thinking."),
    ]);
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new()
        .with_root_model("mock:root")
        .with_max_iterations(2);
    let (engine, bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_nofinal");
    let result = engine.auto_process("small output", &opts).await.unwrap();

    assert!(result.processed.contains("[No final answer after 2 iterations"));
    assert_eq!(result.stats.iterations, 2);
    assert_eq!(bus.count(topics::ITERATION), 2);
}

#[tokio::test]
async fn test_root_model_failure_falls_back_enhanced() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    // Non-retryable failure: falls straight through to enhanced fallback.
    let root = MockModel::with_outcomes(vec![Err(RlmError::Execution("provider down".to_string()))]);
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_down");
    let result = engine.auto_process(&"data\n".repeat(100), &opts).await.unwrap();

    assert!(result.processed.contains("## Fallback Summary"));
    assert_eq!(bus.count(topics::COMPLETE), 1);
}

#[tokio::test]
async fn test_final_var_resolved_by_print_capture() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::with_text(
        "```python\nsummary = 'built from ' + str(len(context)) + ' chars'\nFINAL_VAR(summary)\n```",
    );
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, _bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_var");
    let result = engine.auto_process("0123456789", &opts).await.unwrap();

    assert!(result.processed.contains("built from 10 chars"));
}

#[tokio::test]
async fn test_final_var_missing_variable_gets_placeholder() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::with_text("```python\nFINAL_VAR(never_defined)\n```");
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, _bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_missing_var");
    let result = engine.auto_process("content", &opts).await.unwrap();

    assert!(result.processed.contains("[Variable never_defined retrieved]"));
}

#[tokio::test]
async fn test_sandbox_error_feeds_back_and_loop_continues() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let root = MockModel::new(vec![
        ModelResponse::text("```python\nraise RuntimeError('oops')\n```"),
        ModelResponse::text("```python\nFINAL('recovered after error')\n```"),
    ]);
    let provider = Arc::new(StaticProvider::new(Arc::new(root)));
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, _bus) = make_deps(provider, config, dir.path());

    let opts = AutoProcessOptions::new("bash", "sess_err");
    let result = engine.auto_process("content", &opts).await.unwrap();

    assert!(result.processed.contains("recovered after error"));
    assert_eq!(result.stats.iterations, 2);
}
