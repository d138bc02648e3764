//! otto-core — the engine of the otto autonomous coding-agent runtime.
//!
//! ## The loop
//! - `agent` — the turn engine and tool orchestrator
//! - `ai` — LLM driver, provider adapters, retry discipline
//! - `autonomous` — supervisor, response analyzer, circuit breaker, rate limiter
//!
//! ## State
//! - `context` — message log, token accounting, compaction, loop detection
//! - `session` — session state, checkpoints, durable store
//!
//! ## Policy and plumbing
//! - `safety` — approval policies, dangerous-command scan, path containment,
//!   secret scrubbing
//! - `tools` — registry and execution contract
//! - `events` — the ordered event stream consumers subscribe to
//! - `skills` — named prompt-augmenting resources

pub mod agent;
pub mod ai;
pub mod autonomous;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod safety;
pub mod session;
pub mod skills;
pub mod tools;

pub use agent::{ToolOrchestrator, TurnEngine, TurnOutcome};
pub use ai::{ChatProvider, HttpProvider, LlmDriver, ScriptedProvider, ScriptedResponse};
pub use autonomous::{
    AutonomousSupervisor, CircuitBreaker, CircuitState, HaltReason, PromptBundle, RateLimiter,
    ResponseAnalyzer, RunReport, StatusSnapshot,
};
pub use config::RuntimeConfig;
pub use context::ContextManager;
pub use error::{EngineError, Result};
pub use events::{AgentEvent, AgentEventKind, EndReason, EventStream};
pub use safety::{ApprovalPolicy, SafetyGate};
pub use session::{FsSessionStore, Session, SessionStore};
pub use skills::SkillRegistry;
pub use tools::{Tool, ToolCapabilities, ToolContext, ToolRegistry, ToolResult};
