//! Answer-quality gate.
//!
//! After the loop finishes, the candidate answer is inspected for the three
//! ways a run goes quietly wrong: an answer too short to be useful, an
//! implausible compression ratio, or a refusal dressed up as an answer.
//! A failed check redirects the run to the enhanced fallback; it is never
//! surfaced as an error.

use std::sync::LazyLock;

use regex::Regex;

/// Minimum output tokens before a large input's answer counts as real.
const MIN_OUTPUT_TOKENS: u64 = 100;
/// Input size above which brevity becomes suspicious.
const SHORT_INPUT_FLOOR: u64 = 5000;
/// Input/output ratio above which the answer is considered over-compressed.
const MAX_COMPRESSION_RATIO: u64 = 100;

static REFUSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bI (do not|don't) have (the )?(previous )?context\b",
        r"(?i)\bunable to (access|retrieve|find)\b",
        r"(?i)context.*(not |un)available",
        r"(?i)\bno (content|context|data) (was |is )?provided\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid refusal pattern"))
    .collect()
});

/// Outcome of the post-loop answer inspection.
#[derive(Debug, Clone, Copy)]
pub struct QualityCheck {
    pub too_short: bool,
    pub over_compressed: bool,
    pub refusal: bool,
}

impl QualityCheck {
    /// Inspect an answer against its input size.
    pub fn evaluate(answer: &str, input_tokens: u64, output_tokens: u64) -> Self {
        let too_short = output_tokens < MIN_OUTPUT_TOKENS && input_tokens > SHORT_INPUT_FLOOR;
        let over_compressed = input_tokens / output_tokens.max(1) > MAX_COMPRESSION_RATIO;
        let refusal = REFUSAL_PATTERNS.iter().any(|p| p.is_match(answer));

        Self {
            too_short,
            over_compressed,
            refusal,
        }
    }

    /// Whether any check tripped.
    pub fn failed(&self) -> bool {
        self.too_short || self.over_compressed || self.refusal
    }

    /// Short label for logging.
    pub fn reason(&self) -> &'static str {
        if self.refusal {
            "refusal"
        } else if self.too_short {
            "too_short"
        } else if self.over_compressed {
            "over_compressed"
        } else {
            "ok"
        }
    }
}
