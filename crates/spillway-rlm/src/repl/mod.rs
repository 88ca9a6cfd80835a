//! Sandboxed REPL backends.
//!
//! Two interchangeable backends share the line protocol in [`protocol`]:
//! a scripting backend (long-lived Python interpreter, fast cold start) and
//! a compiled backend (Go supervisor that compiles each block, heavier
//! startup, static typing). The pool in [`pool`] picks between them.
//!
//! A [`ReplHandle`] owns exactly one child process, one scratch directory,
//! and buffered stdio. At most one `execute` runs per handle at a time, and
//! a handle is never shared across control-loop invocations.

pub mod golang;
pub mod pool;
pub mod protocol;
pub mod python;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;

use crate::error::{Result, RlmError};
use crate::host::AbortSignal;
use protocol::{MarkerScanner, ProtocolEvent, SubQueryRequest};

pub use golang::CompiledBackend;
pub use python::ScriptingBackend;

// ============================================================================
// Runtime Selection
// ============================================================================

/// Configurable REPL runtime.
///
/// Three names map onto the two backends: both scripting variants drive the
/// Python backend (`scripting-fast` runs the interpreter in isolated mode
/// and is assumed present), while `compiled` drives the Go backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Runtime {
    ScriptingDefault,
    #[default]
    ScriptingFast,
    Compiled,
}

impl Runtime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScriptingDefault => "scripting-default",
            Self::ScriptingFast => "scripting-fast",
            Self::Compiled => "compiled",
        }
    }

    /// Code-fence language tag recognized for this runtime.
    pub const fn fence_tag(self) -> &'static str {
        match self {
            Self::ScriptingDefault | Self::ScriptingFast => "python",
            Self::Compiled => "go",
        }
    }

    /// Wall-clock budget for one `execute`.
    pub const fn exec_timeout(self) -> Duration {
        match self {
            Self::ScriptingDefault | Self::ScriptingFast => Duration::from_secs(30),
            Self::Compiled => Duration::from_secs(60),
        }
    }

    /// Budget for the child to reach its ready banner.
    pub const fn init_timeout(self) -> Duration {
        match self {
            Self::ScriptingDefault | Self::ScriptingFast => Duration::from_secs(10),
            Self::Compiled => Duration::from_secs(30),
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Execution Results
// ============================================================================

/// A captured final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalAnswer {
    /// Literal answer text.
    Text(String),
    /// Name of a variable holding the answer; resolved by a print-capture.
    Variable(String),
}

/// Result of executing one code block.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutput {
    /// Stdout with protocol markers stripped.
    pub stdout: String,
    /// Stderr, mirrored verbatim.
    pub stderr: String,
    /// First FINAL emitted during the block, if any.
    pub final_answer: Option<FinalAnswer>,
}

/// Receives sub-model requests surfaced during an `execute`.
///
/// Requests are dispatched strictly in arrival order, one at a time; the
/// child does not issue a second request before its previous response lands.
#[async_trait]
pub trait SubQueryHandler: Send {
    async fn handle(&mut self, request: SubQueryRequest) -> String;
}

/// Handler for blocks that must not issue sub-queries (exploration, print
/// captures). Returns a sentinel the in-sandbox code can detect.
pub struct RejectSubQueries;

#[async_trait]
impl SubQueryHandler for RejectSubQueries {
    async fn handle(&mut self, _request: SubQueryRequest) -> String {
        "[sub-queries are not available in this block]".to_string()
    }
}

// ============================================================================
// Backend Dispatch
// ============================================================================

/// The two backend implementations behind one capability set.
pub enum ReplBackend {
    Scripting(ScriptingBackend),
    Compiled(CompiledBackend),
}

impl ReplBackend {
    /// Backend for a configured runtime.
    pub fn for_runtime(runtime: Runtime) -> Self {
        match runtime {
            Runtime::ScriptingDefault | Runtime::ScriptingFast => {
                Self::Scripting(ScriptingBackend::new(runtime))
            }
            Runtime::Compiled => Self::Compiled(CompiledBackend::new()),
        }
    }

    /// Probe for the interpreter binary.
    pub async fn available(&self) -> bool {
        match self {
            Self::Scripting(b) => b.available().await,
            Self::Compiled(b) => b.available().await,
        }
    }

    /// Spawn a child with the context installed, ready for code blocks.
    pub async fn create(&self, context: &str, data_root: &Path) -> Result<ReplHandle> {
        match self {
            Self::Scripting(b) => b.create(context, data_root).await,
            Self::Compiled(b) => b.create(context, data_root).await,
        }
    }
}

/// Probe whether a binary responds to a version flag.
pub(crate) async fn probe_binary(binary: &str, arg: &str) -> bool {
    Command::new(binary)
        .arg(arg)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Strip proxy variables so the child cannot reach the network through the
/// ambient environment.
pub(crate) fn scrub_proxy_env(cmd: &mut Command) {
    for var in [
        "HTTP_PROXY",
        "HTTPS_PROXY",
        "ALL_PROXY",
        "http_proxy",
        "https_proxy",
        "all_proxy",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("NO_PROXY", "*");
}

// ============================================================================
// Handle
// ============================================================================

/// A live REPL child with its scratch directory.
pub struct ReplHandle {
    id: String,
    runtime: Runtime,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: ChildStderr,
    scratch_dir: PathBuf,
    destroyed: bool,
}

impl ReplHandle {
    /// Spawn the prepared command and wait for the ready banner.
    ///
    /// `scratch_dir` is owned by the handle from this point and removed on
    /// destroy, including on init failure.
    pub(crate) async fn spawn(
        runtime: Runtime,
        mut cmd: Command,
        scratch_dir: PathBuf,
    ) -> Result<Self> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            let _ = std::fs::remove_dir_all(&scratch_dir);
            RlmError::Init(format!("failed to spawn {runtime} REPL: {e}"))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| RlmError::Init("no stdin pipe".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| RlmError::Init("no stdout pipe".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| RlmError::Init("no stderr pipe".into()))?;

        let mut handle = Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            runtime,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            scratch_dir,
            destroyed: false,
        };

        if let Err(e) = handle.wait_for_banner().await {
            handle.destroy().await;
            return Err(e);
        }

        tracing::debug!(runtime = %runtime, handle = %handle.id, "REPL ready");
        Ok(handle)
    }

    /// Read stdout until the ready banner, within the init timeout.
    async fn wait_for_banner(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.runtime.init_timeout();
        let mut acc = String::new();
        let mut stderr_acc = String::new();
        let mut buf = [0u8; 4096];
        let mut ebuf = [0u8; 4096];

        loop {
            tokio::select! {
                read = self.stdout.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RlmError::Init(format!(
                            "{} REPL exited before ready banner: {}",
                            self.runtime,
                            preview(&stderr_acc, 400)
                        )));
                    }
                    acc.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = acc.find('\n') {
                        let line: String = acc.drain(..=pos).collect();
                        if line.starts_with(protocol::READY_BANNER_PREFIX) {
                            return Ok(());
                        }
                    }
                }
                read = self.stderr.read(&mut ebuf) => {
                    if let Ok(n) = read {
                        stderr_acc.push_str(&String::from_utf8_lossy(&ebuf[..n]));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RlmError::Init(format!(
                        "{} REPL did not become ready within {:?}",
                        self.runtime,
                        self.runtime.init_timeout()
                    )));
                }
            }
        }
    }

    /// Execute one code block, dispatching sub-queries to the handler.
    ///
    /// Stdout is returned with protocol markers stripped; the first FINAL
    /// wins. Sandbox errors land in stderr and do not kill the handle.
    pub async fn execute(
        &mut self,
        code: &str,
        handler: &mut dyn SubQueryHandler,
        abort: &AbortSignal,
    ) -> Result<ExecuteOutput> {
        abort.check()?;

        let block_id = uuid::Uuid::new_v4().simple().to_string();
        let framed = format!(
            "{}{block_id}\n{code}\n{}{block_id}\n",
            protocol::CODE_START_PREFIX,
            protocol::CODE_END_PREFIX
        );
        self.stdin.write_all(framed.as_bytes()).await?;
        self.stdin.flush().await?;

        let timeout = self.runtime.exec_timeout();
        let deadline = Instant::now() + timeout;
        let mut scanner = MarkerScanner::new();
        let mut out = ExecuteOutput::default();
        let mut buf = [0u8; 8192];
        let mut ebuf = [0u8; 8192];

        loop {
            tokio::select! {
                _ = abort.cancelled() => {
                    return Err(RlmError::Cancelled);
                }
                read = self.stdout.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RlmError::Execution(format!(
                            "REPL exited mid-block: {}",
                            preview(&out.stderr, 400)
                        )));
                    }
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    for event in scanner.push(&chunk) {
                        match event {
                            ProtocolEvent::Output(text) => out.stdout.push_str(&text),
                            ProtocolEvent::SubQuery(request) => {
                                let response = handler.handle(request).await;
                                let reply = serde_json::json!({"response": response});
                                self.stdin.write_all(reply.to_string().as_bytes()).await?;
                                self.stdin.write_all(b"\n").await?;
                                self.stdin.flush().await?;
                            }
                            ProtocolEvent::Final(answer) => {
                                if out.final_answer.is_none() {
                                    out.final_answer = Some(FinalAnswer::Text(answer));
                                }
                            }
                            ProtocolEvent::FinalVar(name) => {
                                if out.final_answer.is_none() {
                                    out.final_answer = Some(FinalAnswer::Variable(name));
                                }
                            }
                            ProtocolEvent::Done(id) => {
                                if id == block_id {
                                    return Ok(out);
                                }
                                tracing::warn!(expected = %block_id, got = %id, "Stray DONE marker");
                            }
                        }
                    }
                }
                read = self.stderr.read(&mut ebuf) => {
                    if let Ok(n) = read {
                        if n > 0 {
                            out.stderr.push_str(&String::from_utf8_lossy(&ebuf[..n]));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RlmError::ExecutionTimeout(timeout));
                }
            }
        }
    }

    /// Runtime this handle was created for.
    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    /// Unique handle id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Terminate the child and remove the scratch directory. Idempotent.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.scratch_dir).await {
            tracing::debug!(error = %e, dir = %self.scratch_dir.display(), "Scratch cleanup failed");
        }
    }
}

impl Drop for ReplHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            // kill_on_drop reaps the child; the scratch dir goes here.
            let _ = std::fs::remove_dir_all(&self.scratch_dir);
        }
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.trim_end().to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
