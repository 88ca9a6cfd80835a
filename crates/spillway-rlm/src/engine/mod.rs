//! The recursive control loop.
//!
//! `auto_process` is the heart of the runtime: it loads oversized tool
//! output into a REPL, lets the root model write code against it, dispatches
//! the sub-model queries that code issues, and captures the final answer.
//!
//! State machine per invocation:
//!
//! ```text
//! Init ──▶ Explore ──▶ Iterate* ──▶ Finalize ──▶ Done
//!   │          │           │            │
//!   │          ▼           ▼            ▼
//!   └────▶ structural   enhanced    quality gate ──▶ enhanced fallback
//!          truncation   fallback
//! ```
//!
//! Every run returns a rendered string with a summary prefix, even on
//! failure; only configuration errors propagate as `Err`.

mod quality;

pub use quality::QualityCheck;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::chunker::{self, ChunkOptions, ContentClass};
use crate::config::RlmConfig;
use crate::error::{Result, RlmError};
use crate::events::{
    self, CompleteEvent, IterationEvent, SharedBus, SubcallEvent, TraceEndEvent, TraceStartEvent,
    TraceStepEvent, topics,
};
use crate::fallback::{self, SMART_TRUNCATE_BUDGET};
use crate::host::{
    AbortSignal, ConversationTurn, ModelProvider, ModelRequest, SharedModel, parse_model_ref,
    with_retry,
};
use crate::prompts;
use crate::repl::pool::ReplPool;
use crate::repl::protocol::SubQueryRequest;
use crate::repl::{FinalAnswer, RejectSubQueries, ReplHandle, Runtime, SubQueryHandler};
use crate::tokens::estimate_tokens;
use spillway_tracing::{StepKind, TraceHeader, TraceStore};

/// Inputs above this are pre-compressed before loading into the REPL.
const COMPRESS_TRIGGER_TOKENS: u64 = 50_000;
/// Target size of the pre-compression.
const COMPRESS_TARGET_TOKENS: u64 = 40_000;
/// Recent-line window preserved by the pre-compression.
const COMPRESS_PRESERVE_RECENT: usize = 200;
/// Output cap for root and sub model calls.
const MODEL_MAX_OUTPUT_TOKENS: u32 = 4000;
/// Code output fed back into the conversation is clipped to this many chars.
const CODE_OUTPUT_LIMIT_CHARS: usize = 3000;
/// Root-model retry policy.
const ROOT_RETRIES: u32 = 2;
const ROOT_BACKOFF: Duration = Duration::from_secs(1);
/// Returned to in-sandbox code once the sub-call cap is hit.
const MAX_SUBCALLS_SENTINEL: &str = "[Max subcalls reached - batch more context into each call]";

/// Progress sink for hosts that stream status to a UI.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Dependencies composed by the host.
#[derive(Clone)]
pub struct EngineDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub bus: SharedBus,
    pub traces: Arc<TraceStore>,
    pub pool: Arc<ReplPool>,
    pub config: RlmConfig,
}

impl EngineDeps {
    /// Wire up deps with a fresh trace store and pool rooted at `data_root`.
    ///
    /// Must be called from within a tokio runtime (the pool starts its
    /// sweeper task).
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        bus: SharedBus,
        config: RlmConfig,
        data_root: std::path::PathBuf,
    ) -> Self {
        Self {
            provider,
            bus,
            traces: Arc::new(TraceStore::new()),
            pool: ReplPool::new(data_root),
            config,
        }
    }
}

/// Options for one `auto_process` run.
#[derive(Clone)]
pub struct AutoProcessOptions {
    pub tool_id: String,
    pub tool_args: serde_json::Value,
    pub session_id: String,
    pub abort: AbortSignal,
    pub on_progress: Option<ProgressFn>,
    /// Skip auto-classification and use this class instead.
    pub class_override: Option<ContentClass>,
}

impl AutoProcessOptions {
    pub fn new(tool_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_args: serde_json::Value::Null,
            session_id: session_id.into(),
            abort: AbortSignal::none(),
            on_progress: None,
            class_override: None,
        }
    }

    pub fn with_class(mut self, class: ContentClass) -> Self {
        self.class_override = Some(class);
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.tool_args = args;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.on_progress = Some(progress);
        self
    }

    fn progress(&self, message: &str) {
        if let Some(f) = &self.on_progress {
            f(message);
        }
    }
}

/// Statistics for a finished run.
#[derive(Debug, Clone, Copy)]
pub struct AutoProcessStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub iterations: u32,
    pub subcalls: u32,
}

/// A finished run: the rendered answer plus its statistics.
#[derive(Debug, Clone)]
pub struct AutoProcessResult {
    pub processed: String,
    pub stats: AutoProcessStats,
}

/// Per-run bookkeeping shared by the helper methods.
struct RunCtx<'a> {
    opts: &'a AutoProcessOptions,
    trace_id: String,
    input_tokens: u64,
    class: ContentClass,
    started: Instant,
}

/// Outcome of the iterate phase.
struct LoopOutcome {
    final_answer: Option<String>,
    iterations: u32,
    subcalls: u32,
    /// Answer already is a structural fallback; skip the quality gate.
    gate_exempt: bool,
}

/// The control-loop driver.
pub struct AutoProcessor {
    deps: EngineDeps,
}

impl AutoProcessor {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &EngineDeps {
        &self.deps
    }

    /// Run the recursive analysis over one tool output.
    ///
    /// Always yields a rendered result; only `RlmError::Config` surfaces as
    /// an error. Cancellation and internal failures degrade to structural
    /// truncation.
    pub async fn auto_process(
        &self,
        output: &str,
        opts: &AutoProcessOptions,
    ) -> Result<AutoProcessResult> {
        let started = Instant::now();
        let input_tokens = estimate_tokens(output);
        let class = opts
            .class_override
            .unwrap_or_else(|| chunker::classify(output));

        let trace_id = self.deps.traces.start(TraceHeader {
            session_id: opts.session_id.clone(),
            tool_id: opts.tool_id.clone(),
            input_tokens,
            content_class: class.to_string(),
        });
        events::publish(
            self.deps.bus.as_ref(),
            topics::TRACE_START,
            &TraceStartEvent {
                trace_id: trace_id.clone(),
                session_id: opts.session_id.clone(),
                tool: opts.tool_id.clone(),
                input_tokens,
                content_class: class.to_string(),
            },
        );

        let ctx = RunCtx {
            opts,
            trace_id,
            input_tokens,
            class,
            started,
        };

        match self.drive(output, &ctx).await {
            Ok(result) => Ok(result),
            Err(RlmError::Config(msg)) => {
                self.end_trace(&ctx, Some(&msg));
                Err(RlmError::Config(msg))
            }
            Err(RlmError::Cancelled) => {
                tracing::info!(session = %opts.session_id, "RLM run cancelled");
                self.end_trace(&ctx, Some("cancelled"));
                let truncated =
                    fallback::smart_truncate(output, &opts.tool_id, &opts.tool_args, SMART_TRUNCATE_BUDGET);
                let body = format!("[RLM cancelled; structural truncation below]\n\n{}", truncated.content);
                Ok(self.render(body, &ctx, 0, 0))
            }
            Err(e) => {
                tracing::warn!(error = %e, session = %opts.session_id, "RLM run failed");
                self.end_trace(&ctx, Some(&e.to_string()));
                let truncated =
                    fallback::smart_truncate(output, &opts.tool_id, &opts.tool_args, SMART_TRUNCATE_BUDGET);
                let body = format!("[RLM error: {e}]\n\n{}", truncated.content);
                Ok(self.render(body, &ctx, 0, 0))
            }
        }
    }

    async fn drive(&self, original: &str, ctx: &RunCtx<'_>) -> Result<AutoProcessResult> {
        let cfg = &self.deps.config;
        ctx.opts.abort.check()?;

        // Resolve models up front; a missing root model skips the loop.
        let Some(root_ref) = cfg.root_model.as_deref() else {
            tracing::warn!("No root model configured; falling back to truncation");
            return Ok(self.truncated_result(original, ctx, "no root model configured"));
        };
        parse_model_ref(root_ref)?;
        let root_model = match self.deps.provider.get(root_ref) {
            Ok(model) => model,
            Err(RlmError::Config(msg)) => return Err(RlmError::Config(msg)),
            Err(e) => {
                tracing::warn!(error = %e, model = root_ref, "Root model unavailable");
                return Ok(self.truncated_result(original, ctx, "root model unavailable"));
            }
        };
        let sub_model = cfg
            .subcall_model_ref()
            .and_then(|r| self.deps.provider.get(r).ok());

        // Oversized input is structurally compressed before it ever reaches
        // the REPL.
        let compressed;
        let context: &str = if ctx.input_tokens > COMPRESS_TRIGGER_TOKENS {
            compressed = chunker::compress(
                original,
                COMPRESS_TARGET_TOKENS,
                &ChunkOptions::new().with_preserve_recent(COMPRESS_PRESERVE_RECENT),
            );
            tracing::debug!(
                input_tokens = ctx.input_tokens,
                compressed_tokens = estimate_tokens(&compressed),
                "Pre-compressed oversized input"
            );
            &compressed
        } else {
            original
        };

        let runtime = self.deps.pool.select_runtime(cfg.runtime).await;
        let mut handle = match self.deps.pool.acquire(runtime, context).await {
            Ok(handle) => handle,
            Err(RlmError::Cancelled) => return Err(RlmError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, runtime = %runtime, "REPL init failed");
                self.trace_error(ctx, None, &format!("repl init: {e}"));
                return Ok(self.truncated_result(original, ctx, "REPL unavailable"));
            }
        };
        ctx.opts.progress(&format!("REPL ready ({runtime})"));

        let mut dispatcher = SubcallDispatcher {
            model: sub_model,
            bus: Arc::clone(&self.deps.bus),
            traces: Arc::clone(&self.deps.traces),
            trace_id: ctx.trace_id.clone(),
            session_id: ctx.opts.session_id.clone(),
            abort: ctx.opts.abort.clone(),
            count: 0,
            max: cfg.max_subcalls,
        };

        let outcome = self
            .iterate(context, original, ctx, runtime, &mut handle, &root_model, &mut dispatcher)
            .await;

        match outcome {
            Ok(outcome) => {
                self.deps.pool.release(handle).await;
                Ok(self.finish(outcome, original, ctx))
            }
            Err(e) => {
                self.deps.pool.discard(handle).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn iterate(
        &self,
        context: &str,
        original: &str,
        ctx: &RunCtx<'_>,
        runtime: Runtime,
        handle: &mut ReplHandle,
        root_model: &SharedModel,
        dispatcher: &mut SubcallDispatcher,
    ) -> Result<LoopOutcome> {
        let cfg = &self.deps.config;
        let abort = &ctx.opts.abort;

        // Explore: canned look at the context before the model's first turn.
        let exploration = match handle
            .execute(prompts::exploration_code(runtime), &mut RejectSubQueries, abort)
            .await
        {
            Ok(out) => {
                self.deps.traces.step(
                    &ctx.trace_id,
                    StepKind::Exploration,
                    serde_json::json!({"stdout_chars": out.stdout.chars().count()}),
                );
                self.trace_step_event(ctx, StepKind::Exploration, None);
                out.stdout
            }
            Err(RlmError::Cancelled) => return Err(RlmError::Cancelled),
            Err(e) => {
                self.trace_error(ctx, None, &format!("exploration: {e}"));
                let answer =
                    fallback::build_enhanced_fallback(original, &ctx.opts.tool_id, &ctx.opts.tool_args, ctx.input_tokens);
                return Ok(LoopOutcome {
                    final_answer: Some(answer),
                    iterations: 0,
                    subcalls: dispatcher.count,
                    gate_exempt: true,
                });
            }
        };
        ctx.opts.progress("explored context");

        let task = prompts::task_query(&ctx.opts.tool_id, &ctx.opts.tool_args);
        let initial = if prompts::is_self_contained(&ctx.opts.tool_id) {
            format!(
                "{task}\n\nInitial exploration of the context:\n{}",
                clip(&exploration, CODE_OUTPUT_LIMIT_CHARS)
            )
        } else {
            format!(
                "{}\n\nInitial exploration of the context:\n{}",
                prompts::system_prompt(
                    runtime,
                    context.chars().count(),
                    context.lines().count(),
                    ctx.class,
                    &task,
                ),
                clip(&exploration, CODE_OUTPUT_LIMIT_CHARS)
            )
        };

        let mut conversation = vec![ConversationTurn::user(initial)];
        let mut final_answer: Option<String> = None;
        let mut iterations = 0u32;

        for iteration in 0..cfg.max_iterations {
            abort.check()?;
            iterations = iteration + 1;

            let request = ModelRequest::new(conversation.clone(), MODEL_MAX_OUTPUT_TOKENS)
                .with_abort(abort.clone());
            let text = match with_retry(ROOT_RETRIES, ROOT_BACKOFF, "root model", || {
                root_model.complete(request.clone())
            })
            .await
            {
                Ok(response) => response.text,
                Err(RlmError::Cancelled) => return Err(RlmError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, iteration, "Root model failed; enhanced fallback");
                    self.trace_error(ctx, Some(iteration), &format!("root model: {e}"));
                    let answer = fallback::build_enhanced_fallback(
                        original,
                        &ctx.opts.tool_id,
                        &ctx.opts.tool_args,
                        ctx.input_tokens,
                    );
                    return Ok(LoopOutcome {
                        final_answer: Some(answer),
                        iterations,
                        subcalls: dispatcher.count,
                        gate_exempt: true,
                    });
                }
            };

            conversation.push(ConversationTurn::assistant(text.clone()));

            let blocks = extract_code_blocks(&text, runtime);
            let mut last_output = text.clone();
            let mut captured: Option<FinalAnswer> = None;

            for code in &blocks {
                match handle.execute(code, dispatcher, abort).await {
                    Ok(out) => {
                        self.deps.traces.step_at(
                            &ctx.trace_id,
                            StepKind::CodeExec,
                            serde_json::json!({
                                "stdout_chars": out.stdout.chars().count(),
                                "stderr_chars": out.stderr.chars().count(),
                            }),
                            Some(iteration),
                        );
                        self.trace_step_event(ctx, StepKind::CodeExec, Some(iteration));

                        last_output = combine_output(&out.stdout, &out.stderr);
                        if let Some(answer) = out.final_answer {
                            captured = Some(answer);
                            break;
                        }
                        conversation.push(ConversationTurn::user(format!(
                            "Code output:\n{}",
                            clip(&last_output, CODE_OUTPUT_LIMIT_CHARS)
                        )));
                    }
                    Err(RlmError::Cancelled) => return Err(RlmError::Cancelled),
                    Err(RlmError::ExecutionTimeout(t)) => {
                        tracing::warn!(iteration, "REPL execute timed out after {t:?}");
                        self.trace_error(ctx, Some(iteration), "execution timeout");
                        conversation.push(ConversationTurn::user(
                            "[Code execution timed out; the REPL was restarted with the same context]"
                                .to_string(),
                        ));
                        self.reopen(handle, runtime, context).await?;
                    }
                    Err(e) => {
                        self.trace_error(ctx, Some(iteration), &e.to_string());
                        conversation.push(ConversationTurn::user(format!(
                            "[Code execution failed: {e}]"
                        )));
                    }
                }
            }

            // A reply with no code can still finish the run textually.
            if blocks.is_empty() && captured.is_none() {
                captured = extract_textual_final(&text);
            }

            if let Some(answer) = captured {
                final_answer = Some(self.resolve_final(answer, handle, abort).await);
            }

            self.deps.traces.step_at(
                &ctx.trace_id,
                StepKind::Iteration,
                serde_json::json!({
                    "code_blocks": blocks.len(),
                    "has_final": final_answer.is_some(),
                }),
                Some(iteration),
            );
            events::publish(
                self.deps.bus.as_ref(),
                topics::ITERATION,
                &IterationEvent {
                    session_id: ctx.opts.session_id.clone(),
                    iteration,
                    max_iterations: cfg.max_iterations,
                    code_blocks_found: blocks.len(),
                    has_final: final_answer.is_some(),
                },
            );
            ctx.opts.progress(&format!(
                "iteration {}/{} ({} code blocks)",
                iteration + 1,
                cfg.max_iterations,
                blocks.len()
            ));

            if final_answer.is_some() {
                break;
            }

            conversation.push(ConversationTurn::user(prompts::continuation_prompt(&last_output)));
        }

        Ok(LoopOutcome {
            final_answer,
            iterations,
            subcalls: dispatcher.count,
            gate_exempt: false,
        })
    }

    /// Turn a captured FINAL into answer text, resolving variable captures
    /// with a print round-trip.
    async fn resolve_final(
        &self,
        answer: FinalAnswer,
        handle: &mut ReplHandle,
        abort: &AbortSignal,
    ) -> String {
        match answer {
            FinalAnswer::Text(text) => text,
            FinalAnswer::Variable(name) => {
                let placeholder = format!("[Variable {name} retrieved]");
                if name.is_empty()
                    || !name.chars().all(|c| c.is_alphanumeric() || c == '_')
                {
                    return placeholder;
                }
                let code = match handle.runtime().fence_tag() {
                    "go" => format!("fmt.Println({name})"),
                    _ => format!("print({name})"),
                };
                match handle.execute(&code, &mut RejectSubQueries, abort).await {
                    Ok(out) if !out.stdout.trim().is_empty() => out.stdout.trim().to_string(),
                    _ => placeholder,
                }
            }
        }
    }

    /// Replace a wedged handle with a fresh one holding the same context.
    async fn reopen(
        &self,
        handle: &mut ReplHandle,
        runtime: Runtime,
        context: &str,
    ) -> Result<()> {
        let fresh = self.deps.pool.acquire(runtime, context).await?;
        let old = std::mem::replace(handle, fresh);
        self.deps.pool.discard(old).await;
        Ok(())
    }

    /// Finalize a loop outcome: quality gate, events, rendered result.
    fn finish(&self, outcome: LoopOutcome, original: &str, ctx: &RunCtx<'_>) -> AutoProcessResult {
        let mut answer = outcome.final_answer.unwrap_or_else(|| {
            format!(
                "[No final answer after {} iterations and {} sub-calls]",
                outcome.iterations, outcome.subcalls
            )
        });

        if !outcome.gate_exempt {
            let check = QualityCheck::evaluate(&answer, ctx.input_tokens, estimate_tokens(&answer));
            if check.failed() {
                tracing::warn!(reason = check.reason(), "Answer failed quality gate");
                self.deps.traces.step(
                    &ctx.trace_id,
                    StepKind::Error,
                    serde_json::json!({"error": "quality_gate", "reason": check.reason()}),
                );
                answer = fallback::build_enhanced_fallback(
                    original,
                    &ctx.opts.tool_id,
                    &ctx.opts.tool_args,
                    ctx.input_tokens,
                );
            }
        }

        let output_tokens = estimate_tokens(&answer);
        self.deps.traces.step(
            &ctx.trace_id,
            StepKind::Final,
            serde_json::json!({"output_tokens": output_tokens}),
        );
        self.trace_step_event(ctx, StepKind::Final, None);
        self.deps.traces.end_ok(&ctx.trace_id, answer.clone());
        self.publish_trace_end(ctx, true);

        events::publish(
            self.deps.bus.as_ref(),
            topics::COMPLETE,
            &CompleteEvent {
                session_id: ctx.opts.session_id.clone(),
                input_tokens: ctx.input_tokens,
                output_tokens,
                iterations: outcome.iterations,
                subcalls: outcome.subcalls,
                elapsed_ms: ctx.started.elapsed().as_millis() as u64,
                compression_ratio: ctx.input_tokens as f64 / output_tokens.max(1) as f64,
            },
        );

        self.render(answer, ctx, outcome.iterations, outcome.subcalls)
    }

    /// Structural-truncation result for paths where the loop never ran.
    fn truncated_result(&self, original: &str, ctx: &RunCtx<'_>, note: &str) -> AutoProcessResult {
        let truncated = fallback::smart_truncate(
            original,
            &ctx.opts.tool_id,
            &ctx.opts.tool_args,
            SMART_TRUNCATE_BUDGET,
        );
        let body = format!("[RLM skipped: {note}]\n\n{}", truncated.content);

        self.deps.traces.end_ok(&ctx.trace_id, body.clone());
        self.publish_trace_end(ctx, true);
        events::publish(
            self.deps.bus.as_ref(),
            topics::COMPLETE,
            &CompleteEvent {
                session_id: ctx.opts.session_id.clone(),
                input_tokens: ctx.input_tokens,
                output_tokens: estimate_tokens(&body),
                iterations: 0,
                subcalls: 0,
                elapsed_ms: ctx.started.elapsed().as_millis() as u64,
                compression_ratio: ctx.input_tokens as f64 / estimate_tokens(&body).max(1) as f64,
            },
        );

        self.render(body, ctx, 0, 0)
    }

    /// Prefix the answer with the one-line run summary.
    fn render(
        &self,
        body: String,
        ctx: &RunCtx<'_>,
        iterations: u32,
        subcalls: u32,
    ) -> AutoProcessResult {
        let output_tokens = estimate_tokens(&body);
        let processed = format!(
            "[RLM: {} → {} tokens | {} iterations | {} sub-calls]\n{}",
            ctx.input_tokens, output_tokens, iterations, subcalls, body
        );

        AutoProcessResult {
            processed,
            stats: AutoProcessStats {
                input_tokens: ctx.input_tokens,
                output_tokens,
                iterations,
                subcalls,
            },
        }
    }

    fn trace_error(&self, ctx: &RunCtx<'_>, iteration: Option<u32>, message: &str) {
        self.deps.traces.step_at(
            &ctx.trace_id,
            StepKind::Error,
            serde_json::json!({"error": message}),
            iteration,
        );
        self.trace_step_event(ctx, StepKind::Error, iteration);
    }

    fn trace_step_event(&self, ctx: &RunCtx<'_>, kind: StepKind, iteration: Option<u32>) {
        events::publish(
            self.deps.bus.as_ref(),
            topics::TRACE_STEP,
            &TraceStepEvent {
                trace_id: ctx.trace_id.clone(),
                kind: kind.tag().to_string(),
                iteration,
            },
        );
    }

    fn end_trace(&self, ctx: &RunCtx<'_>, error: Option<&str>) {
        match error {
            Some(message) => self.deps.traces.end_error(&ctx.trace_id, message),
            None => self.deps.traces.end_ok(&ctx.trace_id, ""),
        }
        self.publish_trace_end(ctx, error.is_none());
    }

    fn publish_trace_end(&self, ctx: &RunCtx<'_>, success: bool) {
        events::publish(
            self.deps.bus.as_ref(),
            topics::TRACE_END,
            &TraceEndEvent {
                trace_id: ctx.trace_id.clone(),
                success,
                duration_ms: ctx.started.elapsed().as_millis() as u64,
            },
        );
    }
}

// ============================================================================
// Sub-call Dispatch
// ============================================================================

/// Routes sandbox sub-queries to the sub model, enforcing the cap and
/// numbering calls 1..n with no gaps.
struct SubcallDispatcher {
    model: Option<SharedModel>,
    bus: SharedBus,
    traces: Arc<TraceStore>,
    trace_id: String,
    session_id: String,
    abort: AbortSignal,
    count: u32,
    max: u32,
}

#[async_trait]
impl SubQueryHandler for SubcallDispatcher {
    async fn handle(&mut self, request: SubQueryRequest) -> String {
        if self.abort.is_aborted() {
            return "[Cancelled]".to_string();
        }
        if self.count >= self.max {
            return MAX_SUBCALLS_SENTINEL.to_string();
        }
        let Some(model) = self.model.clone() else {
            return "[Sub-model unavailable]".to_string();
        };

        self.count += 1;
        let number = self.count;

        let prompt = match &request.output {
            Some(output) => format!("{}\n\n{}", request.prompt, output),
            None => request.prompt.clone(),
        };
        let prompt_tokens = estimate_tokens(&prompt);

        // Sub-model calls are user-facing batch work: no retries.
        let result = model
            .complete(
                ModelRequest::from_prompt(prompt, MODEL_MAX_OUTPUT_TOKENS)
                    .with_abort(self.abort.clone()),
            )
            .await;

        match result {
            Ok(response) => {
                let response_tokens = estimate_tokens(&response.text);
                self.traces.step(
                    &self.trace_id,
                    StepKind::Subcall,
                    serde_json::json!({
                        "number": number,
                        "prompt_tokens": prompt_tokens,
                        "response_tokens": response_tokens,
                    }),
                );
                events::publish(
                    self.bus.as_ref(),
                    topics::SUBCALL,
                    &SubcallEvent {
                        session_id: self.session_id.clone(),
                        subcall_number: number,
                        prompt_tokens,
                        response_tokens,
                    },
                );
                response.text
            }
            Err(e) => {
                tracing::warn!(error = %e, number, "Sub-query failed");
                self.traces.step(
                    &self.trace_id,
                    StepKind::Error,
                    serde_json::json!({"error": format!("subcall {number}: {e}")}),
                );
                format!("[Sub-query failed: {e}]")
            }
        }
    }
}

// ============================================================================
// Parsing Helpers
// ============================================================================

/// Pull fenced code blocks tagged for the runtime (or untagged) out of a
/// model reply, in textual order.
fn extract_code_blocks(text: &str, runtime: Runtime) -> Vec<String> {
    let accepted: &[&str] = match runtime.fence_tag() {
        "go" => &["", "go", "golang"],
        _ => &["", "python", "py", "python3"],
    };

    let mut blocks = Vec::new();
    let mut current: Option<(bool, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            match current.take() {
                Some((wanted, lines)) => {
                    if wanted && !lines.is_empty() {
                        blocks.push(lines.join("\n"));
                    }
                }
                None => {
                    let tag = trimmed.trim_start_matches('`').trim().to_lowercase();
                    current = Some((accepted.contains(&tag.as_str()), Vec::new()));
                }
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    blocks
}

/// Recognize a literal `FINAL("...")` or `FINAL_VAR(name)` in plain text.
fn extract_textual_final(text: &str) -> Option<FinalAnswer> {
    use std::sync::LazyLock;
    static FINAL_VAR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"FINAL_VAR\(\s*([A-Za-z_]\w*)\s*\)").expect("invalid pattern")
    });
    static FINAL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r#"(?s)FINAL\(\s*["'](.*?)["']\s*\)"#).expect("invalid pattern")
    });

    if let Some(cap) = FINAL_VAR_RE.captures(text) {
        return Some(FinalAnswer::Variable(cap[1].to_string()));
    }
    FINAL_RE
        .captures(text)
        .map(|cap| FinalAnswer::Text(cap[1].to_string()))
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}\n[truncated]")
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n--- stderr ---\n{stderr}")
    }
}

#[cfg(test)]
mod tests;
