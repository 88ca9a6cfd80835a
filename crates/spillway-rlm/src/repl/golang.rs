//! Compiled REPL backend.
//!
//! Spawns a long-lived `go run` supervisor that owns the line protocol. For
//! each framed code block the supervisor writes a snippet program (the block
//! spliced into a prelude defining `context`, `sub_query`, and the helper
//! surface), compiles and runs it, and relays its stdio, so the in-band
//! markers stream through unchanged. Compile errors land on stderr like any
//! other execution error.
//!
//! Unlike the scripting backend, state does not persist between blocks; each
//! block is a fresh program. Startup is heavier (the supervisor itself is
//! compiled first), which is why this runtime gets the longer init and
//! execute budgets.

use std::path::Path;

use tokio::process::Command;

use crate::error::Result;
use crate::repl::{ReplHandle, Runtime, probe_binary, scrub_proxy_env};

const INTERPRETER: &str = "go";
const SUPERVISOR_FILE: &str = "main.go";
const PRELUDE_FILE: &str = "prelude.go.tmpl";
const CONTEXT_FILE: &str = "context.txt";

/// Go-based compiled backend.
pub struct CompiledBackend;

impl CompiledBackend {
    pub fn new() -> Self {
        Self
    }

    /// Probe for the Go toolchain.
    pub async fn available(&self) -> bool {
        probe_binary(INTERPRETER, "version").await
    }

    /// Write the scratch directory and spawn the supervisor.
    pub async fn create(&self, context: &str, data_root: &Path) -> Result<ReplHandle> {
        let scratch = data_root.join(format!("repl-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&scratch).await?;
        tokio::fs::write(scratch.join(CONTEXT_FILE), context).await?;
        tokio::fs::write(scratch.join(SUPERVISOR_FILE), GO_SUPERVISOR).await?;
        tokio::fs::write(scratch.join(PRELUDE_FILE), GO_PRELUDE).await?;

        let mut cmd = Command::new(INTERPRETER);
        cmd.arg("run")
            .arg(SUPERVISOR_FILE)
            .arg(CONTEXT_FILE)
            .current_dir(&scratch)
            // Self-contained toolchain state, and no module fetches.
            .env("GOCACHE", scratch.join("gocache"))
            .env("GOPATH", scratch.join("gopath"))
            .env("GOPROXY", "off");
        scrub_proxy_env(&mut cmd);

        ReplHandle::spawn(Runtime::Compiled, cmd, scratch).await
    }
}

impl Default for CompiledBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// The long-lived supervisor: owns the frame protocol, compiles each block.
const GO_SUPERVISOR: &str = r#"package main

import (
	"bufio"
	"fmt"
	"io"
	"os"
	"os/exec"
	"path/filepath"
	"strings"
)

func main() {
	if len(os.Args) < 2 {
		fmt.Fprintln(os.Stderr, "usage: supervisor <context-file>")
		os.Exit(1)
	}
	ctxPath, err := filepath.Abs(os.Args[1])
	if err != nil {
		fmt.Fprintln(os.Stderr, "resolve context path:", err)
		os.Exit(1)
	}
	data, err := os.ReadFile(ctxPath)
	if err != nil {
		fmt.Fprintln(os.Stderr, "read context:", err)
		os.Exit(1)
	}
	tmpl, err := os.ReadFile("prelude.go.tmpl")
	if err != nil {
		fmt.Fprintln(os.Stderr, "read prelude:", err)
		os.Exit(1)
	}

	text := string(data)
	fmt.Printf("Context loaded: %d characters, %d lines\n", len(text), len(strings.Split(text, "\n")))

	stdinCh := make(chan string)
	go func() {
		r := bufio.NewReaderSize(os.Stdin, 1<<20)
		for {
			line, err := r.ReadString('\n')
			if len(line) > 0 {
				stdinCh <- strings.TrimRight(line, "\r\n")
			}
			if err != nil {
				close(stdinCh)
				return
			}
		}
	}()

	var block []string
	blockID := ""
	for line := range stdinCh {
		if strings.HasPrefix(line, "CODE_START_") {
			blockID = strings.TrimPrefix(line, "CODE_START_")
			block = nil
		} else if blockID != "" && line == "CODE_END_"+blockID {
			runBlock(strings.Join(block, "\n"), string(tmpl), ctxPath, stdinCh)
			fmt.Println("DONE_" + blockID)
			blockID = ""
			block = nil
		} else if blockID != "" {
			block = append(block, line)
		}
	}
}

func runBlock(code, tmpl, ctxPath string, stdinCh chan string) {
	src := strings.Replace(tmpl, "//BLOCK//", code, 1)
	if err := os.MkdirAll("snippet", 0o755); err != nil {
		fmt.Fprintln(os.Stderr, "snippet dir:", err)
		return
	}
	srcPath := filepath.Join("snippet", "main.go")
	if err := os.WriteFile(srcPath, []byte(src), 0o644); err != nil {
		fmt.Fprintln(os.Stderr, "write snippet:", err)
		return
	}

	cmd := exec.Command("go", "run", srcPath, ctxPath)
	cmd.Stderr = os.Stderr
	stdout, err := cmd.StdoutPipe()
	if err != nil {
		fmt.Fprintln(os.Stderr, "stdout pipe:", err)
		return
	}
	stdin, err := cmd.StdinPipe()
	if err != nil {
		fmt.Fprintln(os.Stderr, "stdin pipe:", err)
		return
	}
	if err := cmd.Start(); err != nil {
		fmt.Fprintln(os.Stderr, "start snippet:", err)
		return
	}

	done := make(chan struct{})
	go func() {
		io.Copy(os.Stdout, stdout)
		close(done)
	}()

	for {
		select {
		case line, ok := <-stdinCh:
			if !ok {
				stdin.Close()
				cmd.Wait()
				return
			}
			fmt.Fprintln(stdin, line)
		case <-done:
			stdin.Close()
			cmd.Wait()
			return
		}
	}
}
"#;

/// Snippet prelude: the code block replaces `//BLOCK//` inside `main`.
/// Helper names match the scripting backend so prompts stay
/// runtime-agnostic. Stdlib only; every import is used by the prelude
/// itself, so an arbitrary block cannot break compilation through them.
const GO_PRELUDE: &str = r#"package main

import (
	"bufio"
	"encoding/json"
	"fmt"
	"os"
	"regexp"
	"strings"
)

var context string
var _stdin = bufio.NewReaderSize(os.Stdin, 1<<20)

func sub_query(prompt string, output ...string) string {
	payload := map[string]string{"prompt": prompt}
	if len(output) > 0 {
		payload["output"] = strings.Join(output, "\n")
	}
	b, _ := json.Marshal(payload)
	fmt.Printf("LLM_REQUEST_START%sLLM_REQUEST_END\n", string(b))
	line, err := _stdin.ReadString('\n')
	if err != nil {
		return ""
	}
	var resp map[string]string
	if json.Unmarshal([]byte(line), &resp) == nil {
		return resp["response"]
	}
	return ""
}

func lines() []string { return strings.Split(context, "\n") }

func head(n int) string {
	ls := lines()
	if n > len(ls) {
		n = len(ls)
	}
	return strings.Join(ls[:n], "\n")
}

func tail(n int) string {
	ls := lines()
	if n > len(ls) {
		n = len(ls)
	}
	return strings.Join(ls[len(ls)-n:], "\n")
}

func grep(pattern string) []string {
	re := regexp.MustCompile(pattern)
	var out []string
	for _, l := range lines() {
		if re.MatchString(l) {
			out = append(out, l)
		}
	}
	return out
}

func count(pattern string) int { return len(grep(pattern)) }

func chunk(n int) []string {
	ls := lines()
	if n < 1 {
		n = 1
	}
	size := (len(ls) + n - 1) / n
	if size < 1 {
		size = 1
	}
	var out []string
	for i := 0; i < len(ls); i += size {
		end := i + size
		if end > len(ls) {
			end = len(ls)
		}
		out = append(out, strings.Join(ls[i:end], "\n"))
	}
	return out
}

func FINAL(answer string) {
	fmt.Printf("FINAL_%s_FINAL_END\n", answer)
}

func FINAL_VAR(name string) {
	fmt.Printf("FINAL_VAR_%s_FINAL_VAR_END\n", name)
}

func main() {
	data, err := os.ReadFile(os.Args[1])
	if err != nil {
		fmt.Fprintln(os.Stderr, "read context:", err)
		os.Exit(1)
	}
	context = string(data)
	_ = context
//BLOCK//
}
"#;
