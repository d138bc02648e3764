//! LLM driver and provider adapters.
//!
//! `ChatProvider` is the minimum provider surface the engine depends on;
//! `LlmDriver` layers retry, cancellation, and event forwarding on top of it.

pub mod driver;
pub mod provider;
pub mod retry;
pub mod scripted;
pub mod types;

pub use driver::{DriveResult, LlmDriver};
pub use provider::{ChatProvider, HttpProvider};
pub use retry::{with_retry, RetryBudget, RetryConfig};
pub use scripted::{ScriptedProvider, ScriptedResponse};
pub use types::{
    AiTool, AiToolCall, Content, DoneReason, ModelMessage, Role, StreamPart, Usage,
};
