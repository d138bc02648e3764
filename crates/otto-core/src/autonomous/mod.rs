//! Autonomous mode.
//!
//! The supervisor drives turns in a loop, guarded by the response analyzer,
//! the circuit breaker, and the rate limiter, persisting a status snapshot
//! and an iteration log as it goes.

pub mod analyzer;
pub mod circuit;
pub mod rate_limit;
pub mod status;
pub mod supervisor;

pub use analyzer::{ResponseAnalysis, ResponseAnalyzer};
pub use circuit::{CircuitBreaker, CircuitState, TickInput};
pub use rate_limit::RateLimiter;
pub use status::StatusSnapshot;
pub use supervisor::{AutonomousSupervisor, HaltReason, PromptBundle, RunReport};
