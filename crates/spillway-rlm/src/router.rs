//! Routing decisions for oversized tool output.
//!
//! The router is the top of the pipeline: given a tool output and its
//! context, it decides whether the output goes back to the agent untouched
//! or is diverted into the RLM control loop. The decision is a pure function
//! of the config and the inputs; the router holds no state across calls.
//!
//! # Decision Flow
//!
//! ```text
//! output, ctx
//!     │
//!     ▼
//! mode off? ──────────────── yes ──▶ passthrough (mode_off)
//!     │ no
//!     ▼
//! tool eligible? ─────────── no ───▶ passthrough (tool_not_eligible)
//!     │ yes
//!     ▼
//! mode always? ───────────── yes ──▶ route (mode_always)
//!     │ no
//!     ▼
//! tokens > θ·limit? ──────── yes ──▶ route (exceeds_threshold)
//!     │ no
//!     ▼
//! current + tokens > 0.8·limit? ─── yes ──▶ route (would_overflow)
//!     │ no
//!     ▼
//! passthrough (within_threshold)
//! ```

use serde::{Deserialize, Serialize};

use crate::config::RlmConfig;
use crate::events::{self, EventBus, RoutingDecisionEvent, topics};
use crate::tokens::estimate_tokens;

/// Tools whose output is eligible for RLM routing.
pub const ELIGIBLE_TOOLS: &[&str] = &["read", "glob", "grep", "bash"];

/// Fraction of the context limit treated as the overflow ceiling.
const OVERFLOW_FRACTION: f64 = 0.8;

/// When routing happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Never route.
    Off,
    /// Route when thresholds say so.
    #[default]
    Auto,
    /// Route every eligible output.
    Always,
}

impl RoutingMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Always => "always",
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a routing decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    ModeOff,
    ModeAlways,
    ToolNotEligible,
    ExceedsThreshold,
    WouldOverflow,
    WithinThreshold,
}

impl RouteReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModeOff => "mode_off",
            Self::ModeAlways => "mode_always",
            Self::ToolNotEligible => "tool_not_eligible",
            Self::ExceedsThreshold => "exceeds_threshold",
            Self::WouldOverflow => "would_overflow",
            Self::WithinThreshold => "within_threshold",
        }
    }
}

/// The verdict for one tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Whether to divert into the RLM pipeline.
    pub route: bool,
    pub reason: RouteReason,
    pub estimated_tokens: u64,
}

/// Context accompanying a tool output.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub tool_id: String,
    pub session_id: String,
    pub call_id: Option<String>,
    /// Context window of the agent's model, in tokens.
    pub model_context_limit: u64,
    /// Tokens already occupying that window, when known.
    pub current_context_tokens: Option<u64>,
}

/// Stateless router over a config snapshot.
pub struct Router {
    config: RlmConfig,
}

impl Router {
    pub fn new(config: RlmConfig) -> Self {
        Self { config }
    }

    /// Decide whether a tool output should be routed.
    pub fn should_route(&self, output: &str, ctx: &RoutingContext) -> RoutingDecision {
        let estimated_tokens = estimate_tokens(output);
        let decide = |route: bool, reason: RouteReason| RoutingDecision {
            route,
            reason,
            estimated_tokens,
        };

        if self.config.mode == RoutingMode::Off {
            return decide(false, RouteReason::ModeOff);
        }

        if !ELIGIBLE_TOOLS.contains(&ctx.tool_id.as_str()) {
            return decide(false, RouteReason::ToolNotEligible);
        }

        if self.config.mode == RoutingMode::Always {
            return decide(true, RouteReason::ModeAlways);
        }

        let threshold_tokens = self.config.threshold * ctx.model_context_limit as f64;
        if estimated_tokens as f64 > threshold_tokens {
            return decide(true, RouteReason::ExceedsThreshold);
        }

        if let Some(current) = ctx.current_context_tokens {
            let ceiling = OVERFLOW_FRACTION * ctx.model_context_limit as f64;
            if (current + estimated_tokens) as f64 > ceiling {
                return decide(true, RouteReason::WouldOverflow);
            }
        }

        decide(false, RouteReason::WithinThreshold)
    }

    /// Publish the decision on the host bus.
    pub fn emit_decision(&self, bus: &dyn EventBus, ctx: &RoutingContext, decision: &RoutingDecision) {
        let event = RoutingDecisionEvent {
            tool: ctx.tool_id.clone(),
            session_id: ctx.session_id.clone(),
            call_id: ctx.call_id.clone(),
            decision: if decision.route {
                "routed".to_string()
            } else {
                "passthrough".to_string()
            },
            reason: decision.reason.as_str().to_string(),
            estimated_tokens: decision.estimated_tokens,
            context_limit: ctx.model_context_limit,
            threshold: self.config.threshold,
            mode: self.config.mode.to_string(),
        };

        tracing::debug!(
            tool = %ctx.tool_id,
            session = %ctx.session_id,
            routed = decision.route,
            reason = decision.reason.as_str(),
            tokens = decision.estimated_tokens,
            "Routing decision"
        );

        events::publish(bus, topics::ROUTING_DECISION, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryBus;

    fn ctx(tool: &str, limit: u64) -> RoutingContext {
        RoutingContext {
            tool_id: tool.to_string(),
            session_id: "sess_1".to_string(),
            call_id: None,
            model_context_limit: limit,
            current_context_tokens: None,
        }
    }

    #[test]
    fn test_mode_off_never_routes() {
        let router = Router::new(RlmConfig::new().with_mode(RoutingMode::Off));
        let decision = router.should_route(&"x".repeat(1_000_000), &ctx("bash", 128_000));
        assert!(!decision.route);
        assert_eq!(decision.reason, RouteReason::ModeOff);
    }

    #[test]
    fn test_ineligible_tool_passes_through() {
        let router = Router::new(RlmConfig::default());
        let decision = router.should_route(&"x".repeat(1_000_000), &ctx("edit", 128_000));
        assert!(!decision.route);
        assert_eq!(decision.reason, RouteReason::ToolNotEligible);
    }

    #[test]
    fn test_mode_always_routes_eligible() {
        let router = Router::new(RlmConfig::new().with_mode(RoutingMode::Always));
        let decision = router.should_route("tiny", &ctx("read", 128_000));
        assert!(decision.route);
        assert_eq!(decision.reason, RouteReason::ModeAlways);
    }

    #[test]
    fn test_mode_always_still_respects_eligibility() {
        let router = Router::new(RlmConfig::new().with_mode(RoutingMode::Always));
        let decision = router.should_route("tiny", &ctx("edit", 128_000));
        assert!(!decision.route);
        assert_eq!(decision.reason, RouteReason::ToolNotEligible);
    }

    #[test]
    fn test_exceeds_threshold() {
        // 50,000 chars is ~12,500 tokens; 0.35 * 128,000 = 44,800 would not
        // trigger, so shrink the limit to make the math visible.
        let router = Router::new(RlmConfig::default());
        let decision = router.should_route(&"x".repeat(50_000), &ctx("bash", 30_000));
        assert!(decision.route);
        assert_eq!(decision.reason, RouteReason::ExceedsThreshold);
        assert_eq!(decision.estimated_tokens, 12_500);
    }

    #[test]
    fn test_within_threshold() {
        let router = Router::new(RlmConfig::default());
        let decision = router.should_route(&"x".repeat(50_000), &ctx("bash", 128_000));
        assert!(!decision.route);
        assert_eq!(decision.reason, RouteReason::WithinThreshold);
        assert_eq!(decision.estimated_tokens, 12_500);
    }

    #[test]
    fn test_would_overflow() {
        let router = Router::new(RlmConfig::default());
        let mut context = ctx("grep", 128_000);
        context.current_context_tokens = Some(95_000);

        // 12,500 tokens on top of 95,000 clears 0.8 * 128,000 = 102,400.
        let decision = router.should_route(&"x".repeat(50_000), &context);
        assert!(decision.route);
        assert_eq!(decision.reason, RouteReason::WouldOverflow);
    }

    #[test]
    fn test_overflow_needs_known_context_usage() {
        let router = Router::new(RlmConfig::default());
        let decision = router.should_route(&"x".repeat(50_000), &ctx("grep", 128_000));
        assert!(!decision.route);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let router = Router::new(RlmConfig::default());
        let output = "x".repeat(10_000);
        let context = ctx("read", 64_000);
        let a = router.should_route(&output, &context);
        let b = router.should_route(&output, &context);
        assert_eq!(a, b);
    }

    #[test]
    fn test_emit_decision_publishes_event() {
        let router = Router::new(RlmConfig::default());
        let bus = MemoryBus::new();
        let context = ctx("bash", 128_000);
        let decision = router.should_route(&"x".repeat(200_000), &context);
        router.emit_decision(&bus, &context, &decision);

        let payloads = bus.of_kind(topics::ROUTING_DECISION);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["tool"], "bash");
        assert_eq!(payloads[0]["decision"], "routed");
        assert_eq!(payloads[0]["reason"], "exceeds_threshold");
        assert_eq!(payloads[0]["mode"], "auto");
        assert_eq!(payloads[0]["contextLimit"], 128_000);
    }
}
