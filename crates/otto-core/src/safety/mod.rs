//! Safety gate.
//!
//! Sits between "the model wants to call tool T with args A" and "tool T
//! runs". Classifies the call, consults the approval policy, contains path
//! arguments, and scrubs secrets from whatever comes back. Rejections are
//! non-retryable and become tool failures without the handler ever running.

pub mod dangerous;
pub mod paths;
pub mod secrets;

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::types::AiToolCall;
use crate::error::{EngineError, Result};
use crate::tools::registry::ToolCapabilities;

pub use dangerous::{dangerous_command_reason, scan_arguments};
pub use paths::contain_path;
pub use secrets::{is_secret_env_name, sanitize_env, SecretScrubber};

/// Approval policy for tool execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Admit everything.
    Yolo,
    /// Admit reads, writes, and network; ask for destructive/exec.
    #[default]
    Auto,
    /// Admit reads and writes; ask for destructive/exec and network.
    AutoEdit,
    /// Ask for everything.
    OnRequest,
    /// Admit everything, but ask for network calls after their first failure.
    OnFailure,
    /// Deny everything.
    Never,
}

impl FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yolo" => Ok(Self::Yolo),
            "auto" => Ok(Self::Auto),
            "auto-edit" => Ok(Self::AutoEdit),
            "on-request" => Ok(Self::OnRequest),
            "on-failure" => Ok(Self::OnFailure),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown approval policy '{}'", other)),
        }
    }
}

/// How the gate classifies one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    PureRead,
    WriteEdit,
    DestructiveExec,
    Network,
}

/// Gate verdict before any confirmation round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Admit,
    Deny,
    Ask,
}

/// Callback for "ask" decisions. Absent a handler, asks resolve to deny.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, tool: &str, arguments: &Value, reason: &str) -> bool;
}

/// The policy layer between tool intent and tool execution.
pub struct SafetyGate {
    policy: ApprovalPolicy,
    working_dir: PathBuf,
    allowed_roots: Vec<PathBuf>,
    scrubber: SecretScrubber,
    confirmer: Option<Arc<dyn ConfirmationHandler>>,
    /// Network tools that have already failed once (on-failure policy).
    failed_network_tools: Mutex<HashSet<String>>,
}

impl SafetyGate {
    pub fn new(policy: ApprovalPolicy, working_dir: PathBuf) -> Self {
        Self {
            policy,
            working_dir,
            allowed_roots: Vec::new(),
            scrubber: SecretScrubber::default(),
            confirmer: None,
            failed_network_tools: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_scrubber(mut self, scrubber: SecretScrubber) -> Self {
        self.scrubber = scrubber;
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn with_allowed_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.allowed_roots = roots;
        self
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Classify a call from its capabilities and a pattern scan of its
    /// arguments. The scan can escalate any call to destructive.
    pub fn classify(&self, call: &AiToolCall, caps: ToolCapabilities) -> (CallClass, Option<&'static str>) {
        let danger = scan_arguments(&call.arguments);
        if caps.destructive || danger.is_some() {
            return (CallClass::DestructiveExec, danger);
        }
        if caps.executes_process {
            return (CallClass::DestructiveExec, None);
        }
        if caps.network {
            return (CallClass::Network, None);
        }
        if caps.writes_fs {
            return (CallClass::WriteEdit, None);
        }
        (CallClass::PureRead, None)
    }

    fn decide(&self, class: CallClass, tool: &str) -> Decision {
        match self.policy {
            ApprovalPolicy::Yolo => Decision::Admit,
            ApprovalPolicy::Never => Decision::Deny,
            ApprovalPolicy::OnRequest => Decision::Ask,
            ApprovalPolicy::Auto => match class {
                CallClass::DestructiveExec => Decision::Ask,
                _ => Decision::Admit,
            },
            ApprovalPolicy::AutoEdit => match class {
                CallClass::DestructiveExec | CallClass::Network => Decision::Ask,
                _ => Decision::Admit,
            },
            ApprovalPolicy::OnFailure => match class {
                CallClass::Network => {
                    let failed = self
                        .failed_network_tools
                        .lock()
                        .expect("gate state poisoned")
                        .contains(tool);
                    if failed {
                        Decision::Ask
                    } else {
                        Decision::Admit
                    }
                }
                _ => Decision::Admit,
            },
        }
    }

    /// Run the full gate: containment, classification, policy, confirmation.
    pub async fn check(&self, call: &AiToolCall, caps: ToolCapabilities) -> Result<()> {
        if caps.reads_fs || caps.writes_fs {
            self.contain_path_arguments(&call.arguments)?;
        }

        let (class, danger) = self.classify(call, caps);

        match self.decide(class, &call.name) {
            Decision::Admit => Ok(()),
            Decision::Deny => Err(EngineError::ApprovalDenied {
                tool: call.name.clone(),
            }),
            Decision::Ask => {
                let reason = danger.unwrap_or(match class {
                    CallClass::PureRead => "read operation",
                    CallClass::WriteEdit => "write operation",
                    CallClass::DestructiveExec => "destructive or process-executing operation",
                    CallClass::Network => "network operation",
                });

                let approved = match &self.confirmer {
                    Some(confirmer) => {
                        confirmer.confirm(&call.name, &call.arguments, reason).await
                    }
                    None => false,
                };

                if approved {
                    tracing::info!(tool = %call.name, reason, "call approved");
                    Ok(())
                } else if let Some(danger) = danger {
                    tracing::warn!(tool = %call.name, reason = danger, "dangerous command rejected");
                    Err(EngineError::DangerousCommand {
                        reason: danger.to_string(),
                    })
                } else {
                    tracing::info!(tool = %call.name, "call denied");
                    Err(EngineError::ApprovalDenied {
                        tool: call.name.clone(),
                    })
                }
            }
        }
    }

    /// Record a failed network call so on-failure starts asking for that tool.
    pub fn record_network_failure(&self, tool: &str) {
        self.failed_network_tools
            .lock()
            .expect("gate state poisoned")
            .insert(tool.to_string());
    }

    /// Scrub captured output before it enters the context.
    pub fn scrub_output(&self, text: &str) -> String {
        self.scrubber.scrub(text)
    }

    fn contain_path_arguments(&self, args: &Value) -> Result<()> {
        let Some(map) = args.as_object() else {
            return Ok(());
        };
        for (name, value) in map {
            if !paths::is_path_argument(name) {
                continue;
            }
            if let Some(path) = value.as_str() {
                contain_path(path, &self.working_dir, &self.allowed_roots)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysApprove;

    #[async_trait]
    impl ConfirmationHandler for AlwaysApprove {
        async fn confirm(&self, _tool: &str, _args: &Value, _reason: &str) -> bool {
            true
        }
    }

    fn call(name: &str, args: Value) -> AiToolCall {
        AiToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    fn write_caps() -> ToolCapabilities {
        ToolCapabilities {
            writes_fs: true,
            ..Default::default()
        }
    }

    fn exec_caps() -> ToolCapabilities {
        ToolCapabilities {
            executes_process: true,
            ..Default::default()
        }
    }

    fn network_caps() -> ToolCapabilities {
        ToolCapabilities {
            network: true,
            ..Default::default()
        }
    }

    fn gate(policy: ApprovalPolicy) -> SafetyGate {
        SafetyGate::new(policy, std::env::temp_dir())
    }

    #[tokio::test]
    async fn yolo_admits_everything() {
        let gate = gate(ApprovalPolicy::Yolo);
        assert!(gate
            .check(&call("bash", json!({"command": "make"})), exec_caps())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn never_denies_everything() {
        let gate = gate(ApprovalPolicy::Never);
        let err = gate
            .check(&call("echo", json!({})), ToolCapabilities::READ_ONLY)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalDenied { .. }));
    }

    #[tokio::test]
    async fn auto_admits_write_asks_exec() {
        let gate = gate(ApprovalPolicy::Auto);
        assert!(gate
            .check(&call("write", json!({})), write_caps())
            .await
            .is_ok());

        // No confirmer: ask resolves to deny.
        let err = gate
            .check(&call("bash", json!({"command": "make"})), exec_caps())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalDenied { .. }));
    }

    #[tokio::test]
    async fn auto_edit_asks_for_network() {
        let gate = gate(ApprovalPolicy::AutoEdit);
        let err = gate
            .check(&call("http", json!({"url": "https://x"})), network_caps())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalDenied { .. }));
    }

    #[tokio::test]
    async fn confirmation_handler_admits_asked_calls() {
        let gate = gate(ApprovalPolicy::OnRequest).with_confirmer(Arc::new(AlwaysApprove));
        assert!(gate
            .check(&call("echo", json!({})), ToolCapabilities::READ_ONLY)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn dangerous_arguments_are_rejected_under_auto() {
        let gate = gate(ApprovalPolicy::Auto);
        let err = gate
            .check(
                &call("bash", json!({"command": "rm -rf /"})),
                exec_caps(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DangerousCommand { .. }));
    }

    #[tokio::test]
    async fn dangerous_arguments_admitted_under_yolo() {
        let gate = gate(ApprovalPolicy::Yolo);
        assert!(gate
            .check(&call("bash", json!({"command": "rm -rf /"})), exec_caps())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn path_escape_is_rejected_before_policy() {
        let gate = gate(ApprovalPolicy::Yolo);
        let err = gate
            .check(
                &call("read", json!({"path": "../../etc/passwd"})),
                ToolCapabilities::READ_ONLY,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn on_failure_asks_network_after_first_failure() {
        let gate = gate(ApprovalPolicy::OnFailure);
        let http = call("http", json!({"url": "https://x"}));

        assert!(gate.check(&http, network_caps()).await.is_ok());

        gate.record_network_failure("http");
        let err = gate.check(&http, network_caps()).await.unwrap_err();
        assert!(matches!(err, EngineError::ApprovalDenied { .. }));
    }

    #[test]
    fn policy_parses_from_kebab_case() {
        assert_eq!(
            "auto-edit".parse::<ApprovalPolicy>().unwrap(),
            ApprovalPolicy::AutoEdit
        );
        assert_eq!(
            "on-request".parse::<ApprovalPolicy>().unwrap(),
            ApprovalPolicy::OnRequest
        );
        assert!("bogus".parse::<ApprovalPolicy>().is_err());
    }
}
