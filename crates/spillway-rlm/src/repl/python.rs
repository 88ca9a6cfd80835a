//! Scripting REPL backend.
//!
//! Spawns a long-lived `python3` running an embedded harness. The harness
//! loads the context file, installs the helper surface (`sub_query`, line
//! access, `FINAL` emitters), prints the ready banner, then executes framed
//! code blocks in one persistent globals dict so state carries across
//! blocks.
//!
//! The `scripting-fast` runtime adds `-I` (isolated mode: no site packages,
//! no user environment) and skips the availability probe; `scripting-default`
//! probes for the interpreter first.

use std::path::Path;

use tokio::process::Command;

use crate::error::Result;
use crate::repl::{ReplHandle, Runtime, probe_binary, scrub_proxy_env};

const INTERPRETER: &str = "python3";
const HARNESS_FILE: &str = "harness.py";
const CONTEXT_FILE: &str = "context.txt";

/// Python-based scripting backend.
pub struct ScriptingBackend {
    runtime: Runtime,
}

impl ScriptingBackend {
    /// Create for one of the scripting runtimes.
    pub fn new(runtime: Runtime) -> Self {
        debug_assert!(runtime != Runtime::Compiled);
        Self { runtime }
    }

    /// `scripting-fast` is assumed present; `scripting-default` is probed.
    pub async fn available(&self) -> bool {
        match self.runtime {
            Runtime::ScriptingFast => true,
            _ => probe_binary(INTERPRETER, "--version").await,
        }
    }

    /// Write the scratch directory and spawn the harness.
    pub async fn create(&self, context: &str, data_root: &Path) -> Result<ReplHandle> {
        let scratch = data_root.join(format!("repl-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&scratch).await?;
        tokio::fs::write(scratch.join(CONTEXT_FILE), context).await?;
        tokio::fs::write(scratch.join(HARNESS_FILE), PY_HARNESS).await?;

        let mut cmd = Command::new(INTERPRETER);
        if self.runtime == Runtime::ScriptingFast {
            cmd.arg("-I");
        }
        cmd.arg("-u")
            .arg(HARNESS_FILE)
            .arg(CONTEXT_FILE)
            .current_dir(&scratch);
        scrub_proxy_env(&mut cmd);

        ReplHandle::spawn(self.runtime, cmd, scratch).await
    }
}

/// The in-child harness. Kept dependency-free: stdlib only.
const PY_HARNESS: &str = r#"import json
import re
import sys
import traceback


def _read_context(path):
    f = open(path, "r", encoding="utf-8", errors="replace")
    try:
        return f.read()
    finally:
        f.close()


context = _read_context(sys.argv[1])


def sub_query(prompt, output=None):
    payload = {"prompt": str(prompt)}
    if output is not None:
        payload["output"] = str(output)
    sys.stdout.write("LLM_REQUEST_START" + json.dumps(payload) + "LLM_REQUEST_END\n")
    sys.stdout.flush()
    line = sys.stdin.readline()
    if not line:
        return ""
    try:
        return json.loads(line).get("response", "")
    except ValueError:
        return ""


def lines():
    return context.splitlines()


def head(n=50):
    return "\n".join(context.splitlines()[:n])


def tail(n=50):
    return "\n".join(context.splitlines()[-n:])


def grep(pattern):
    rx = re.compile(pattern)
    return [l for l in context.splitlines() if rx.search(l)]


def count(pattern):
    rx = re.compile(pattern)
    total = 0
    for l in context.splitlines():
        if rx.search(l):
            total += 1
    return total


def chunk(n=10):
    ls = context.splitlines()
    if n < 1:
        n = 1
    size = max(1, (len(ls) + n - 1) // n)
    return ["\n".join(ls[i:i + size]) for i in range(0, len(ls), size)]


def FINAL(answer):
    sys.stdout.write("FINAL_" + str(answer) + "_FINAL_END\n")
    sys.stdout.flush()


def FINAL_VAR(name):
    sys.stdout.write("FINAL_VAR_" + str(name) + "_FINAL_VAR_END\n")
    sys.stdout.flush()


_globals = {
    "__builtins__": __builtins__,
    "context": context,
    "sub_query": sub_query,
    "lines": lines,
    "head": head,
    "tail": tail,
    "grep": grep,
    "count": count,
    "chunk": chunk,
    "FINAL": FINAL,
    "FINAL_VAR": FINAL_VAR,
}

sys.stdout.write(
    "Context loaded: %d characters, %d lines\n"
    % (len(context), len(context.splitlines()))
)
sys.stdout.flush()

_block = None
_block_id = None
while True:
    _line = sys.stdin.readline()
    if not _line:
        break
    _line = _line.rstrip("\n")
    if _line.startswith("CODE_START_"):
        _block_id = _line[len("CODE_START_"):]
        _block = []
    elif _block_id is not None and _line == "CODE_END_" + _block_id:
        try:
            exec(compile("\n".join(_block), "<block>", "exec"), _globals)
        except BaseException:
            traceback.print_exc()
            sys.stderr.flush()
        sys.stdout.write("DONE_" + _block_id + "\n")
        sys.stdout.flush()
        _block = None
        _block_id = None
    elif _block_id is not None:
        _block.append(_line)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::AbortSignal;
    use crate::repl::protocol::SubQueryRequest;
    use crate::repl::{FinalAnswer, RejectSubQueries, SubQueryHandler};
    use async_trait::async_trait;

    struct RecordingHandler {
        seen: Vec<SubQueryRequest>,
        responses: Vec<String>,
    }

    #[async_trait]
    impl SubQueryHandler for RecordingHandler {
        async fn handle(&mut self, request: SubQueryRequest) -> String {
            self.seen.push(request);
            if self.responses.is_empty() {
                "default response".to_string()
            } else {
                self.responses.remove(0)
            }
        }
    }

    async fn python_present() -> bool {
        probe_binary(INTERPRETER, "--version").await
    }

    #[tokio::test]
    async fn test_create_and_print() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("line a\nline b", dir.path()).await.unwrap();

        let out = handle
            .execute("print(len(context))", &mut RejectSubQueries, &AbortSignal::none())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "13");
        assert!(out.final_answer.is_none());

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_state_persists_across_blocks() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("ctx", dir.path()).await.unwrap();

        handle
            .execute("x = 41", &mut RejectSubQueries, &AbortSignal::none())
            .await
            .unwrap();
        let out = handle
            .execute("print(x + 1)", &mut RejectSubQueries, &AbortSignal::none())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_sub_query_round_trip() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("payload", dir.path()).await.unwrap();

        let mut handler = RecordingHandler {
            seen: vec![],
            responses: vec!["the answer".to_string()],
        };
        let out = handle
            .execute(
                "r = sub_query('what is this?', head(1))\nprint('got: ' + r)",
                &mut handler,
                &AbortSignal::none(),
            )
            .await
            .unwrap();

        assert_eq!(handler.seen.len(), 1);
        assert_eq!(handler.seen[0].prompt, "what is this?");
        assert_eq!(handler.seen[0].output.as_deref(), Some("payload"));
        assert!(out.stdout.contains("got: the answer"));

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_final_captured() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("ctx", dir.path()).await.unwrap();

        let out = handle
            .execute(
                "print('working')\nFINAL('answer-42')",
                &mut RejectSubQueries,
                &AbortSignal::none(),
            )
            .await
            .unwrap();

        assert_eq!(out.final_answer, Some(FinalAnswer::Text("answer-42".to_string())));
        assert!(out.stdout.contains("working"));
        assert!(!out.stdout.contains("FINAL_"));

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_error_goes_to_stderr_and_handle_survives() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("ctx", dir.path()).await.unwrap();

        let out = handle
            .execute("raise ValueError('boom')", &mut RejectSubQueries, &AbortSignal::none())
            .await
            .unwrap();
        assert!(out.stderr.contains("ValueError"));
        assert!(out.stderr.contains("boom"));

        // The handle keeps working after a sandbox error.
        let out = handle
            .execute("print('still alive')", &mut RejectSubQueries, &AbortSignal::none())
            .await
            .unwrap();
        assert!(out.stdout.contains("still alive"));

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_helpers_available() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend
            .create("alpha\nbeta\ngamma\nbeta again", dir.path())
            .await
            .unwrap();

        let out = handle
            .execute(
                "print(len(lines()))\nprint(count('beta'))\nprint(head(1))",
                &mut RejectSubQueries,
                &AbortSignal::none(),
            )
            .await
            .unwrap();

        let stdout: Vec<&str> = out.stdout.trim().lines().collect();
        assert_eq!(stdout, vec!["4", "2", "alpha"]);

        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_removes_scratch() {
        if !python_present().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptingBackend::new(Runtime::ScriptingFast);
        let mut handle = backend.create("ctx", dir.path()).await.unwrap();

        handle.destroy().await;
        // Idempotent.
        handle.destroy().await;

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
