//! Tool registry.
//!
//! Names are unique, registration happens once at startup, lookup is O(1).
//! The registry enforces the per-call deadline; argument validation happens in
//! the orchestrator before the safety gate ever sees the call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ai::types::AiTool;
use crate::error::{EngineError, Result};

/// Default tool execution timeout (2 minutes).
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// What a tool is allowed to touch. Drives safety-gate classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCapabilities {
    pub reads_fs: bool,
    pub writes_fs: bool,
    pub executes_process: bool,
    pub network: bool,
    pub destructive: bool,
}

impl ToolCapabilities {
    pub const READ_ONLY: Self = Self {
        reads_fs: true,
        writes_fs: false,
        executes_process: false,
        network: false,
        destructive: false,
    };

    pub fn is_pure_read(&self) -> bool {
        !self.writes_fs && !self.executes_process && !self.network && !self.destructive
    }
}

/// Tool execution result.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
    /// The tool's judgment on whether a retry could succeed. The orchestrator
    /// never retries; this is recorded for the model.
    pub retryable: bool,
    /// Observable side effects: paths this call modified.
    pub modified_paths: Vec<String>,
    /// Exit code for process-executing tools.
    pub exit_code: Option<i32>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn success_with_paths(output: impl Into<String>, modified_paths: Vec<String>) -> Self {
        Self {
            output: output.into(),
            modified_paths,
            ..Default::default()
        }
    }

    /// Structured error envelope with an explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        let envelope = serde_json::json!({
            "ok": false,
            "error": { "code": code, "message": msg.to_string() },
        });
        Self {
            output: envelope.to_string(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn error(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("tool_error", msg)
    }

    pub fn invalid_parameters(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    pub fn from_engine_error(err: &EngineError) -> Self {
        let mut result = Self::error_with_code(err.code(), err);
        result.retryable = err.retryable();
        result
    }
}

/// Context handed to a tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    /// Cancellation signal; handlers should honor it at await points.
    pub cancel: CancellationToken,
    /// Per-call deadline override. `Duration::ZERO` means fail immediately.
    pub timeout: Option<Duration>,
    /// Environment for process-executing tools, already sanitized of
    /// secret-shaped variables by the safety gate.
    pub env: HashMap<String, String>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cancel: CancellationToken::new(),
            timeout: None,
            env: HashMap::new(),
        }
    }
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Parse tool parameters, mapping failure to a validation error.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| EngineError::Validation(format!("invalid parameters: {}", e)))
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the argument object.
    fn parameters_schema(&self) -> Value;

    fn capabilities(&self) -> ToolCapabilities;

    /// Resource keys this invocation would mutate, beyond written paths the
    /// orchestrator derives from arguments. Calls sharing a key serialize.
    fn resource_keys(&self, _params: &Value) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// Read-only registry mapping tool names to descriptors.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl ToolRegistry {
    /// Register all tools at once. Duplicate names are a startup error.
    pub fn build(tools: Vec<Arc<dyn Tool>>) -> Result<Self> {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::with_capacity(tools.len());
        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_some() {
                return Err(EngineError::Config(format!(
                    "duplicate tool name '{}'",
                    name
                )));
            }
        }
        Ok(Self {
            tools: map,
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions advertised to the model.
    pub fn ai_tools(&self) -> Vec<AiTool> {
        let mut tools: Vec<AiTool> = self
            .tools
            .values()
            .map(|t| AiTool {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool under its deadline. A zero deadline produces the
    /// timeout error without invoking the handler.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error_with_code("unknown_tool", format!("unknown tool: {}", name));
        };

        let timeout = ctx.timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return ToolResult::from_engine_error(&EngineError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: 0,
            });
        }

        tracing::debug!(tool = name, timeout_secs = timeout.as_secs(), "executing tool");
        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = timeout.as_secs(),
                    "tool execution timed out"
                );
                ToolResult::from_engine_error(&EngineError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}
