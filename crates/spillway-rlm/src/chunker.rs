//! Content classification and semantic chunking.
//!
//! This module turns oversized text into a bounded, priority-ordered
//! selection:
//!
//! - **Classify**: table-driven regex scoring over a bounded line sample
//! - **Chunk**: split at semantic boundaries (turns, fences, declarations,
//!   error markers) into priority-tagged pieces
//! - **Select**: greedy pack under a token budget, highest priority first
//! - **Reassemble**: rejoin with explicit omission markers
//!
//! Everything here is pure: no I/O, no shared state.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tokens::{chars_for_tokens, estimate_tokens, tokens_for_chars};

// ============================================================================
// Classification
// ============================================================================

/// Broad shape of a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentClass {
    Code,
    Documents,
    Logs,
    Conversation,
    Mixed,
}

impl ContentClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Documents => "documents",
            Self::Logs => "logs",
            Self::Conversation => "conversation",
            Self::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum number of lines sampled by `classify` (half head, half tail).
const CLASSIFY_SAMPLE_LINES: usize = 200;
/// A class must hold more than this share of the total score to win.
const CLASSIFY_WIN_SHARE: f64 = 0.3;

/// One named family of line-level indicator patterns.
struct PatternFamily {
    class: ContentClass,
    patterns: Vec<Regex>,
}

fn family(class: ContentClass, patterns: &[&str]) -> PatternFamily {
    PatternFamily {
        class,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("invalid classifier pattern"))
            .collect(),
    }
}

/// Indicator families, scored per sampled line. Adding a family here is the
/// only change needed to teach the classifier a new content shape.
static PATTERN_FAMILIES: LazyLock<Vec<PatternFamily>> = LazyLock::new(|| {
    vec![
        family(
            ContentClass::Code,
            &[
                r"^\s*(pub\s+)?(async\s+)?(fn|def|class|function|impl|struct|enum|interface|trait)\s+\w",
                r"^\s*(import|from|use|require|include)\b",
                r"[{}();]\s*$",
                r"^\s*(let|const|var|return|if|for|while|match)\b",
                r"=>|::|->",
            ],
        ),
        family(
            ContentClass::Logs,
            &[
                r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}",
                r"\b(INFO|WARN|WARNING|ERROR|DEBUG|TRACE|FATAL)\b",
                r"^\[\d",
                r"(?i)\b(exception|traceback|stack trace|exit code)\b",
            ],
        ),
        family(
            ContentClass::Conversation,
            &[
                r"(?i)^(user|assistant|human|ai|system)\s*[:>]",
                r"(?i)^\[(user|assistant)\]",
                r"^>\s",
            ],
        ),
        family(
            ContentClass::Documents,
            &[
                r"^#{1,6}\s",
                r"^\s*[-*+]\s+\w",
                r"^\s*\d+\.\s+\w",
                r"^[A-Z][^\n]{40,}[.!?]\s*$",
            ],
        ),
    ]
});

/// Classify content by scoring a bounded head+tail sample of lines.
///
/// The class whose score exceeds 30% of the total wins; anything less
/// decisive is `Mixed`.
pub fn classify(content: &str) -> ContentClass {
    let lines: Vec<&str> = content.lines().collect();
    let sample: Vec<&str> = if lines.len() <= CLASSIFY_SAMPLE_LINES {
        lines
    } else {
        let half = CLASSIFY_SAMPLE_LINES / 2;
        lines[..half]
            .iter()
            .chain(lines[lines.len() - half..].iter())
            .copied()
            .collect()
    };

    let mut scores: Vec<(ContentClass, usize)> =
        PATTERN_FAMILIES.iter().map(|f| (f.class, 0)).collect();

    for line in &sample {
        for (i, fam) in PATTERN_FAMILIES.iter().enumerate() {
            if fam.patterns.iter().any(|p| p.is_match(line)) {
                scores[i].1 += 1;
            }
        }
    }

    let total: usize = scores.iter().map(|(_, s)| *s).sum();
    if total == 0 {
        return ContentClass::Mixed;
    }

    let (best_class, best_score) = scores
        .iter()
        .max_by_key(|(_, s)| *s)
        .copied()
        .unwrap_or((ContentClass::Mixed, 0));

    if best_score as f64 > CLASSIFY_WIN_SHARE * total as f64 {
        best_class
    } else {
        ContentClass::Mixed
    }
}

/// Analysis guidance attached to each classification.
pub fn processing_hints(class: ContentClass) -> &'static str {
    match class {
        ContentClass::Code => {
            "source code: attend to function and type definitions, imports, and call sites"
        }
        ContentClass::Documents => {
            "structured documents: attend to headings, lists, and key claims"
        }
        ContentClass::Logs => {
            "log output: attend to errors, warnings, timestamps, and repeated patterns"
        }
        ContentClass::Conversation => {
            "conversation transcript: attend to the most recent turns and stated goals"
        }
        ContentClass::Mixed => "mixed content: sample broadly before drilling into any one region",
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// The shape of a chunk's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Code,
    Text,
    ToolOutput,
    Conversation,
}

/// A contiguous, priority-tagged slice of the input.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub content: String,
    pub kind: ChunkKind,
    /// First input line covered (0-based, inclusive).
    pub start_line: usize,
    /// Last input line covered (0-based, inclusive).
    pub end_line: usize,
    pub tokens: u64,
    /// Selection priority, 1 (lowest) to 8 (highest).
    pub priority: u8,
}

/// Options for [`chunk`].
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Chunks larger than this are sub-split.
    pub max_chunk_tokens: u64,
    /// Trailing lines treated as highest priority.
    pub preserve_recent: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 4000,
            preserve_recent: 100,
        }
    }
}

impl ChunkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunk_tokens(mut self, tokens: u64) -> Self {
        self.max_chunk_tokens = tokens;
        self
    }

    pub fn with_preserve_recent(mut self, lines: usize) -> Self {
        self.preserve_recent = lines;
        self
    }
}

/// Priority assigned to sub-split pieces of an oversized chunk.
const SUBSPLIT_PRIORITY: u8 = 3;
/// Priority for lines inside the recent window.
const RECENT_PRIORITY: u8 = 8;

/// A recognized chunk boundary: the kind and priority the new chunk opens with.
struct Boundary {
    kind: ChunkKind,
    priority: u8,
}

struct BoundaryPatterns {
    turn: Regex,
    tool: Regex,
    tool_error: Regex,
    error: Regex,
    fence: Regex,
    file_path: Regex,
    declaration: Regex,
    header: Regex,
}

static BOUNDARIES: LazyLock<BoundaryPatterns> = LazyLock::new(|| BoundaryPatterns {
    turn: Regex::new(r"(?i)^(user|assistant|human)\s*[:>]").expect("invalid pattern"),
    tool: Regex::new(r"^\[Tool\b").expect("invalid pattern"),
    tool_error: Regex::new(r"(?i)^\[Tool\b.*(error|failed)").expect("invalid pattern"),
    error: Regex::new(r"(?i)^\s*(error|fatal|exception|panic(ked)?|traceback)\b").expect("invalid pattern"),
    fence: Regex::new(r"^```").expect("invalid pattern"),
    file_path: Regex::new(r"^(?:[\w.@-]+/)+[\w.@-]+\.\w{1,5}\b").expect("invalid pattern"),
    declaration: Regex::new(
        r"^\s*(pub\s+)?(async\s+)?(fn|def|class|function|impl|struct|enum|trait)\s+\w",
    )
    .expect("invalid pattern"),
    header: Regex::new(r"^#{1,6}\s").expect("invalid pattern"),
});

/// Recognize a boundary at the given line, if any.
fn detect_boundary(line: &str) -> Option<Boundary> {
    let b = &*BOUNDARIES;
    if b.tool_error.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::ToolOutput,
            priority: 8,
        });
    }
    if b.tool.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::ToolOutput,
            priority: 3,
        });
    }
    if b.error.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::Text,
            priority: 8,
        });
    }
    if b.turn.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::Conversation,
            priority: 5,
        });
    }
    if b.header.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::Text,
            priority: 6,
        });
    }
    if b.fence.is_match(line) || b.file_path.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::Code,
            priority: 4,
        });
    }
    if b.declaration.is_match(line) {
        return Some(Boundary {
            kind: ChunkKind::Code,
            priority: 5,
        });
    }
    None
}

/// Split content into priority-tagged chunks at semantic boundaries.
///
/// The returned line ranges partition the input exactly, except that
/// oversized chunks are sub-split into pieces that together cover the
/// parent's range.
pub fn chunk(content: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let recent_start = lines.len().saturating_sub(opts.preserve_recent);
    let mut chunks = Vec::new();

    let mut start = 0usize;
    let mut kind = ChunkKind::Text;
    let mut priority = 1u8;

    for (i, line) in lines.iter().enumerate() {
        if let Some(boundary) = detect_boundary(line) {
            if i > start {
                push_chunk(&mut chunks, &lines, start, i - 1, kind, priority, recent_start, opts);
            }
            start = i;
            kind = boundary.kind;
            priority = boundary.priority;
        } else if i == recent_start && i > start && opts.preserve_recent > 0 {
            // The recent window always starts its own chunk so it survives
            // selection independently of whatever precedes it.
            push_chunk(&mut chunks, &lines, start, i - 1, kind, priority, recent_start, opts);
            start = i;
        }
    }
    push_chunk(&mut chunks, &lines, start, lines.len() - 1, kind, priority, recent_start, opts);

    chunks
}

#[allow(clippy::too_many_arguments)]
fn push_chunk(
    chunks: &mut Vec<Chunk>,
    lines: &[&str],
    start: usize,
    end: usize,
    kind: ChunkKind,
    mut priority: u8,
    recent_start: usize,
    opts: &ChunkOptions,
) {
    if end >= recent_start {
        priority = RECENT_PRIORITY;
    }

    let content = lines[start..=end].join("\n");
    let tokens = estimate_tokens(&content).max(1);

    if tokens <= opts.max_chunk_tokens {
        chunks.push(Chunk {
            content,
            kind,
            start_line: start,
            end_line: end,
            tokens,
            priority,
        });
    } else {
        sub_split(chunks, lines, start, end, kind, opts.max_chunk_tokens);
    }
}

/// Greedily re-split an oversized chunk line by line. Pieces inherit the
/// parent's kind and drop to a fixed mid priority.
fn sub_split(
    chunks: &mut Vec<Chunk>,
    lines: &[&str],
    start: usize,
    end: usize,
    kind: ChunkKind,
    max_tokens: u64,
) {
    let mut piece_start = start;
    // Character count of the accumulating piece, joining newlines included,
    // so the piece's final token estimate matches the greedy check.
    let mut piece_chars = 0usize;

    let mut flush = |chunks: &mut Vec<Chunk>, from: usize, to: usize| {
        let content = lines[from..=to].join("\n");
        chunks.push(Chunk {
            tokens: estimate_tokens(&content).max(1),
            content,
            kind,
            start_line: from,
            end_line: to,
            priority: SUBSPLIT_PRIORITY,
        });
    };

    let mut i = start;
    while i <= end {
        let line_chars = lines[i].chars().count();

        if tokens_for_chars(line_chars) > max_tokens {
            // A single line can blow the budget; hard-split it by characters.
            if i > piece_start {
                flush(chunks, piece_start, i - 1);
            }
            split_long_line(chunks, lines[i], i, kind, max_tokens);
            piece_start = i + 1;
            piece_chars = 0;
            i += 1;
            continue;
        }

        let separator = if piece_chars > 0 { 1 } else { 0 };
        if tokens_for_chars(piece_chars + separator + line_chars) > max_tokens && i > piece_start {
            flush(chunks, piece_start, i - 1);
            piece_start = i;
            piece_chars = line_chars;
        } else {
            piece_chars += separator + line_chars;
        }
        i += 1;
    }

    if piece_start <= end {
        flush(chunks, piece_start, end);
    }
}

/// Split one oversized line into char windows, each within the token budget.
fn split_long_line(
    chunks: &mut Vec<Chunk>,
    line: &str,
    line_no: usize,
    kind: ChunkKind,
    max_tokens: u64,
) {
    let window = chars_for_tokens(max_tokens).max(1);
    let chars: Vec<char> = line.chars().collect();
    for piece in chars.chunks(window) {
        let content: String = piece.iter().collect();
        chunks.push(Chunk {
            tokens: estimate_tokens(&content).max(1),
            content,
            kind,
            start_line: line_no,
            end_line: line_no,
            priority: SUBSPLIT_PRIORITY,
        });
    }
}

// ============================================================================
// Selection & Reassembly
// ============================================================================

/// Pick the highest-priority chunks fitting the token budget.
///
/// Ties prefer later chunks (higher start line); the result is re-sorted
/// into input order.
pub fn select(chunks: &[Chunk], max_tokens: u64) -> Vec<Chunk> {
    let mut ranked: Vec<&Chunk> = chunks.iter().collect();
    ranked.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.start_line.cmp(&a.start_line))
    });

    let mut selected = Vec::new();
    let mut total = 0u64;
    for c in ranked {
        if total + c.tokens <= max_tokens {
            total += c.tokens;
            selected.push(c.clone());
        }
    }

    selected.sort_by_key(|c| (c.start_line, c.end_line));
    selected
}

/// Concatenate selected chunks, marking gaps between non-contiguous ones.
pub fn reassemble(selected: &[Chunk]) -> String {
    let mut out = String::new();
    let mut prev_end: Option<usize> = None;

    for c in selected {
        if let Some(pe) = prev_end {
            if c.start_line > pe + 1 {
                out.push_str(&format!(
                    "\n[... {} lines omitted ...]\n",
                    c.start_line - pe - 1
                ));
            } else {
                out.push('\n');
            }
        }
        out.push_str(&c.content);
        prev_end = Some(c.end_line);
    }

    out
}

/// Compress content under a token budget via chunk/select/reassemble.
///
/// Content already within budget is returned unchanged.
pub fn compress(content: &str, max_tokens: u64, opts: &ChunkOptions) -> String {
    if estimate_tokens(content) <= max_tokens {
        return content.to_string();
    }
    reassemble(&select(&chunk(content, opts), max_tokens))
}

// ============================================================================
// Tests
// ============================================================================
