//! spillway-rlm: Recursive Language Model runtime
//!
//! This crate lets a root language model analyze data larger than its
//! context window by writing code against that data in a sandboxed REPL and
//! recursively invoking sub-models:
//! - Routing decisions for oversized tool output (route vs. pass-through)
//! - Semantic chunking and selection under a token budget
//! - Two interchangeable REPL backends driven by a line protocol over stdio
//! - The recursive control loop: code generation, execution, sub-queries
//! - Deterministic structural fallbacks when the loop yields nothing usable
//!
//! The embedding host supplies models, an event sink, config, and a scratch
//! root; everything else lives here.

pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod host;
pub mod prompts;
pub mod repl;
pub mod router;
pub mod tokens;
pub mod tool;

pub use chunker::{
    Chunk, ChunkKind, ChunkOptions, ContentClass, chunk, classify, compress, processing_hints,
    reassemble, select,
};
pub use config::RlmConfig;
pub use engine::{
    AutoProcessOptions, AutoProcessResult, AutoProcessStats, AutoProcessor, EngineDeps,
    ProgressFn, QualityCheck,
};
pub use error::{Result, RlmError};
pub use events::{
    CompleteEvent, EventBus, IterationEvent, MemoryBus, NullBus, RoutingDecisionEvent, SharedBus,
    SubcallEvent, topics,
};
pub use fallback::{SMART_TRUNCATE_BUDGET, TruncateResult, build_enhanced_fallback, smart_truncate};
pub use host::{
    AbortHandle, AbortSignal, ConversationTurn, LanguageModel, MockModel, ModelProvider,
    ModelRequest, ModelResponse, Role, SharedModel, StaticProvider, parse_model_ref, with_retry,
};
pub use repl::pool::{MAX_POOL_SIZE, ReplPool};
pub use repl::protocol::SubQueryRequest;
pub use repl::{
    CompiledBackend, ExecuteOutput, FinalAnswer, ReplBackend, ReplHandle, Runtime,
    ScriptingBackend, SubQueryHandler,
};
pub use router::{
    ELIGIBLE_TOOLS, RouteReason, Router, RoutingContext, RoutingDecision, RoutingMode,
};
pub use tokens::estimate_tokens;
pub use tool::{ContextType, MIN_RLM_TOKENS, RlmTool, RlmToolContext, RlmToolParams};
