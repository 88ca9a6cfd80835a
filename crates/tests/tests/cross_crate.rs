//! Cross-crate integration and E2E tests
//!
//! These tests drive the full pipeline: routing decision, recursive control
//! loop against a real scripting REPL, event emission, and trace capture.
//! Loop tests skip when no python3 is on the PATH.

use std::sync::Arc;

use spillway_rlm::{
    AutoProcessOptions, AutoProcessor, EngineDeps, MemoryBus, MockModel, ModelResponse, ReplPool,
    RlmConfig, RlmTool, RlmToolContext, RlmToolParams, Router, RoutingContext, RoutingMode,
    StaticProvider, topics,
};
use spillway_tracing::TraceStore;

async fn python_present() -> bool {
    tokio::process::Command::new("python3")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn make_engine(
    responses: Vec<ModelResponse>,
    config: RlmConfig,
    dir: &std::path::Path,
) -> (Arc<AutoProcessor>, Arc<MemoryBus>, Arc<TraceStore>) {
    let bus = Arc::new(MemoryBus::new());
    let traces = Arc::new(TraceStore::new());
    let deps = EngineDeps {
        provider: Arc::new(StaticProvider::new(Arc::new(MockModel::new(responses)))),
        bus: bus.clone(),
        traces: traces.clone(),
        pool: ReplPool::new(dir.to_path_buf()),
        config,
    };
    (Arc::new(AutoProcessor::new(deps)), bus, traces)
}

/// Routing decision feeds the event bus with the full wire payload.
#[tokio::test]
async fn test_route_decision_and_event() {
    let bus = MemoryBus::new();
    let config = RlmConfig::default();
    let router = Router::new(config);

    let ctx = RoutingContext {
        tool_id: "bash".to_string(),
        session_id: "sess_route".to_string(),
        call_id: Some("call_7".to_string()),
        model_context_limit: 32_000,
        current_context_tokens: None,
    };
    let output = "x".repeat(50_000);

    let decision = router.should_route(&output, &ctx);
    assert!(decision.route);
    assert_eq!(decision.estimated_tokens, 12_500);

    router.emit_decision(&bus, &ctx, &decision);
    let events = bus.of_kind(topics::ROUTING_DECISION);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["decision"], "routed");
    assert_eq!(events[0]["callID"], "call_7");
    assert_eq!(events[0]["threshold"], 0.35);
}

/// Mode off never routes, regardless of size.
#[tokio::test]
async fn test_route_mode_off() {
    let router = Router::new(RlmConfig::new().with_mode(RoutingMode::Off));
    let ctx = RoutingContext {
        tool_id: "bash".to_string(),
        session_id: "s".to_string(),
        call_id: None,
        model_context_limit: 8_000,
        current_context_tokens: None,
    };
    let decision = router.should_route(&"y".repeat(500_000), &ctx);
    assert!(!decision.route);
}

/// Full loop: routed output is analyzed in a real REPL, the FINAL answer is
/// captured, and both the trace and the event stream record the run.
#[tokio::test]
async fn test_e2e_loop_with_real_repl() -> anyhow::Result<()> {
    if !python_present().await {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;

    let responses = vec![ModelResponse::text(
        "Counting error lines first.\n```python\nprint(count('ERROR'))\nFINAL('found ' + str(count('ERROR')) + ' error lines')\n```",
    )];
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, bus, traces) = make_engine(responses, config, dir.path());

    let mut log = String::new();
    for i in 0..40 {
        if i % 10 == 0 {
            log.push_str(&format!("2024-05-01T00:00:{:02} ERROR request failed\n", i % 60));
        } else {
            log.push_str(&format!("2024-05-01T00:00:{:02} INFO ok\n", i % 60));
        }
    }

    let opts = AutoProcessOptions::new("bash", "sess_e2e");
    let result = engine.auto_process(&log, &opts).await?;

    assert!(result.processed.starts_with("[RLM: "));
    assert!(result.processed.contains("found 4 error lines"));
    assert_eq!(result.stats.iterations, 1);

    // Event stream carries the run.
    assert_eq!(bus.count(topics::ITERATION), 1);
    assert_eq!(bus.count(topics::COMPLETE), 1);
    assert_eq!(bus.count(topics::TRACE_START), 1);
    assert_eq!(bus.count(topics::TRACE_END), 1);

    // Trace holds the steps and the final answer.
    let session_traces = traces.for_session("sess_e2e", 5);
    assert_eq!(session_traces.len(), 1);
    let trace = &session_traces[0];
    assert!(trace.is_success());
    assert!(trace.final_answer.as_deref().unwrap().contains("found 4 error lines"));
    assert!(!trace.steps.is_empty());

    let rendered = spillway_tracing::format_trace(trace);
    assert!(rendered.contains("[bash]"));
    assert!(rendered.contains("ok"));

    Ok(())
}

/// The manual tool streams progress metadata and returns the processed body.
#[tokio::test]
async fn test_e2e_manual_tool() -> anyhow::Result<()> {
    if !python_present().await {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;

    // The answer must be substantial enough to clear the quality gate for
    // a ~12k token input.
    let responses = vec![ModelResponse::text(
        "```python\nFINAL('manual analysis complete: ' + 'the content is a repeated data line, ' * 30)\n```",
    )];
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, _bus, _traces) = make_engine(responses, config, dir.path());
    let tool = RlmTool::new(engine);

    let updates: Arc<std::sync::Mutex<Vec<serde_json::Value>>> = Arc::default();
    let sink = updates.clone();

    let params = RlmToolParams {
        query: "what is in here?".to_string(),
        content: Some("data line\n".repeat(5_000)),
        ..Default::default()
    };
    let ctx = RlmToolContext::new("sess_manual").with_metadata(Arc::new(move |v| {
        sink.lock().unwrap().push(v);
    }));

    let result = tool.execute(params, ctx).await?;
    assert!(result.contains("manual analysis complete"));

    let updates = updates.lock().unwrap();
    assert!(!updates.is_empty());
    assert!(updates.last().unwrap().get("iterations").is_some());

    Ok(())
}

/// Sub-queries round-trip through the host model and are numbered gap-free.
#[tokio::test]
async fn test_e2e_subqueries_round_trip() {
    if !python_present().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();

    let responses = vec![
        ModelResponse::text(
            "```python\na = sub_query('first half', head(2))\nb = sub_query('second half', tail(2))\nFINAL(a + ' / ' + b)\n```",
        ),
        // Sub-queries route to the same mock via StaticProvider.
        ModelResponse::text("alpha summary"),
        ModelResponse::text("beta summary"),
    ];
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, bus, _traces) = make_engine(responses, config, dir.path());

    let opts = AutoProcessOptions::new("read", "sess_sub");
    let result = engine
        .auto_process("alpha 1\nalpha 2\nbeta 1\nbeta 2", &opts)
        .await
        .unwrap();

    assert!(result.processed.contains("alpha summary / beta summary"));
    assert_eq!(result.stats.subcalls, 2);

    let subcalls = bus.of_kind(topics::SUBCALL);
    assert_eq!(subcalls.len(), 2);
    assert_eq!(subcalls[0]["subcallNumber"], 1);
    assert_eq!(subcalls[1]["subcallNumber"], 2);
}

/// Aborting before the run begins degrades to truncation and stays silent
/// on the iteration/subcall topics.
#[tokio::test]
async fn test_e2e_abort_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let config = RlmConfig::new().with_root_model("mock:root");
    let (engine, bus, _traces) = make_engine(vec![ModelResponse::text("unused")], config, dir.path());

    let (abort_handle, abort) = spillway_rlm::AbortSignal::new();
    abort_handle.abort();

    let opts = AutoProcessOptions::new("grep", "sess_abort").with_abort(abort);
    let result = engine.auto_process(&"z".repeat(100_000), &opts).await.unwrap();

    assert!(result.processed.contains("cancelled"));
    assert_eq!(bus.count(topics::ITERATION), 0);
    assert_eq!(bus.count(topics::SUBCALL), 0);
}
