//! The agent execution engine.
//!
//! - `ToolOrchestrator` — resolves the model's tool calls, runs them under the
//!   safety gate, and records results into the context.
//! - `TurnEngine` — one LLM call plus the tool rounds it triggers.
//! - `failure` — repeated tool-failure fail-fast.

pub mod failure;
pub mod orchestrator;
pub mod turn;

pub use orchestrator::{ExecutedCall, ToolOrchestrator};
pub use turn::{TurnEngine, TurnOutcome};
