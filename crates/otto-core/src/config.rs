//! Runtime configuration.
//!
//! Assembled once at startup from environment variables, then passed down by
//! handle. Nothing in the engine reads the environment after this.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::safety::ApprovalPolicy;

/// Environment variable names understood by `RuntimeConfig::from_env`.
pub mod env_keys {
    pub const API_KEY: &str = "OTTO_API_KEY";
    pub const BASE_URL: &str = "OTTO_BASE_URL";
    pub const MODEL: &str = "OTTO_MODEL";
    pub const SESSION_ROOT: &str = "OTTO_SESSION_ROOT";
    pub const APPROVAL_POLICY: &str = "OTTO_APPROVAL_POLICY";
    pub const RATE_WINDOW_SECS: &str = "OTTO_RATE_WINDOW_SECS";
    pub const RATE_MAX_CALLS: &str = "OTTO_RATE_MAX_CALLS";
    pub const SESSION_EXPIRY_HOURS: &str = "OTTO_SESSION_EXPIRY_HOURS";
    pub const LOOP_MAX: &str = "OTTO_LOOP_MAX";
}

/// Configuration for one runtime process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Provider API credential. Empty is allowed for scripted providers.
    pub api_key: String,
    /// Provider base URL.
    pub base_url: String,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Directory under which per-session state lives.
    pub session_root: PathBuf,
    /// Active approval policy.
    pub approval_policy: ApprovalPolicy,
    /// Rolling rate-limit window in seconds.
    pub rate_window_secs: u64,
    /// Maximum LLM calls per window.
    pub rate_max_calls: u32,
    /// Idle hours after which a session expires.
    pub session_expiry_hours: i64,
    /// Default maximum autonomous iterations.
    pub loop_max: u32,
    /// Tool rounds allowed within a single turn.
    pub max_tool_iterations: u32,
    /// Approximate token cap applied to tool output before it enters context.
    pub tool_output_token_cap: usize,
    /// Per-tool-call deadline in seconds.
    pub tool_timeout_secs: u64,
    /// Parallel tool calls within one turn. 1 means serial.
    pub tool_parallelism: usize,
    /// Estimated-token threshold that triggers compaction.
    pub compaction_threshold_tokens: usize,
    /// Messages kept verbatim at the tail during compaction.
    pub compaction_tail_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            session_root: PathBuf::from(".otto"),
            approval_policy: ApprovalPolicy::default(),
            rate_window_secs: 3600,
            rate_max_calls: 100,
            session_expiry_hours: 24,
            loop_max: 100,
            max_tool_iterations: 8,
            tool_output_token_cap: 2_500,
            tool_timeout_secs: 120,
            tool_parallelism: 1,
            compaction_threshold_tokens: 60_000,
            compaction_tail_window: 10,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Malformed numeric values are a `Config` error rather than a silent
    /// default: a typo'd rate limit should not produce a permissive runtime.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(key) = std::env::var(env_keys::API_KEY) {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var(env_keys::BASE_URL) {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var(env_keys::MODEL) {
            config.model = model;
        }
        if let Ok(root) = std::env::var(env_keys::SESSION_ROOT) {
            config.session_root = PathBuf::from(root);
        }
        if let Ok(policy) = std::env::var(env_keys::APPROVAL_POLICY) {
            config.approval_policy = policy
                .parse()
                .map_err(|e: String| EngineError::Config(e))?;
        }

        config.rate_window_secs =
            parse_env(env_keys::RATE_WINDOW_SECS, config.rate_window_secs)?;
        config.rate_max_calls = parse_env(env_keys::RATE_MAX_CALLS, config.rate_max_calls)?;
        config.session_expiry_hours =
            parse_env(env_keys::SESSION_EXPIRY_HOURS, config.session_expiry_hours)?;
        config.loop_max = parse_env(env_keys::LOOP_MAX, config.loop_max)?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_max_calls == 0 {
            return Err(EngineError::Config(
                "rate_max_calls must be at least 1".to_string(),
            ));
        }
        if self.session_expiry_hours <= 0 {
            return Err(EngineError::Config(
                "session_expiry_hours must be positive".to_string(),
            ));
        }
        if self.tool_parallelism == 0 {
            return Err(EngineError::Config(
                "tool_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}
