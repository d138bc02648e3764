//! Tool registry and execution contract.
//!
//! Concrete tool handlers (file I/O, shell, git, ...) live outside the engine;
//! everything here is the contract they plug into: descriptor, capabilities,
//! validation, deadline enforcement, and output truncation.

pub mod registry;
pub mod schema;
pub mod truncation;

pub use registry::{
    parse_params, Tool, ToolCapabilities, ToolContext, ToolRegistry, ToolResult,
};
pub use schema::validate_arguments;
pub use truncation::truncate_to_tokens;
