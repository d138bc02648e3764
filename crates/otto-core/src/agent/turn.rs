//! The turn engine.
//!
//! One turn is one LLM call plus the tool rounds its response triggers:
//!
//! ```text
//! PREPARE -> CALL_LLM -> (stream)* ->
//!    (EXECUTE_TOOLS -> APPEND_RESULTS -> CALL_LLM)*   until no tool calls
//! -> FINALIZE
//! ```
//!
//! Before every CALL_LLM the context may compact. Cancellation is honored at
//! each CALL_LLM boundary and inside tool execution. Exceeding the tool-round
//! budget appends a system observation and ends the turn.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::driver::LlmDriver;
use crate::ai::types::{AiTool, Content, ModelMessage, Role, Usage};
use crate::context::{ContextManager, LoopDetector};
use crate::error::{new_trace_id, EngineError};
use crate::events::{AgentEventKind, EndReason, EventStream};

use super::failure::detect_repeated_failures;
use super::orchestrator::ToolOrchestrator;

/// Tokens of headroom reclaimed by a compaction pass.
const COMPACTION_HEADROOM: usize = 8_000;

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Concatenated assistant text across all rounds of the turn.
    pub assistant_text: String,
    pub end_reason: EndReason,
    /// Paths tools reported modifying during the turn.
    pub modified_paths: Vec<String>,
    /// Set when the repetition detector fired during this turn.
    pub loop_detected: bool,
    pub usage: Usage,
    pub tool_calls: u32,
    pub tool_failures: u32,
    pub error: Option<String>,
}

pub struct TurnEngine {
    driver: Arc<LlmDriver>,
    orchestrator: ToolOrchestrator,
    tools: Vec<AiTool>,
    max_tool_iterations: u32,
}

impl TurnEngine {
    pub fn new(driver: Arc<LlmDriver>, orchestrator: ToolOrchestrator, tools: Vec<AiTool>) -> Self {
        Self {
            driver,
            orchestrator,
            tools,
            max_tool_iterations: 8,
        }
    }

    pub fn with_max_tool_iterations(mut self, max: u32) -> Self {
        self.max_tool_iterations = max;
        self
    }

    /// Run one turn against the given context.
    pub async fn run_turn(
        &self,
        ctx: &mut ContextManager,
        detector: &mut LoopDetector,
        events: &EventStream,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        events.emit(AgentEventKind::AgentStart);

        let mut assistant_text = String::new();
        let mut modified_paths = Vec::new();
        let mut loop_detected = false;
        let mut usage = Usage::default();
        let mut tool_calls = 0u32;
        let mut tool_failures = 0u32;
        let mut failure_signatures: HashMap<String, usize> = HashMap::new();

        for round in 1..=self.max_tool_iterations {
            if let Some(report) = ctx.compact(COMPACTION_HEADROOM) {
                info!(
                    dropped = report.dropped,
                    retained = report.retained,
                    "context compacted before LLM call"
                );
            }

            if cancel.is_cancelled() {
                return self.finalize(
                    events,
                    assistant_text,
                    EndReason::Cancelled,
                    modified_paths,
                    loop_detected,
                    usage,
                    tool_calls,
                    tool_failures,
                    None,
                );
            }

            let result = match self
                .driver
                .drive(&ctx.view(), &self.tools, events, cancel)
                .await
            {
                Ok(result) => result,
                Err(EngineError::Cancelled) => {
                    return self.finalize(
                        events,
                        assistant_text,
                        EndReason::Cancelled,
                        modified_paths,
                        loop_detected,
                        usage,
                        tool_calls,
                        tool_failures,
                        None,
                    );
                }
                Err(err) => {
                    let trace_id = new_trace_id();
                    warn!(code = err.code(), trace_id = %trace_id, "LLM call failed: {}", err);
                    events.emit(AgentEventKind::AgentError {
                        error: err.to_string(),
                        code: err.code().to_string(),
                        trace_id,
                    });
                    return self.finalize(
                        events,
                        assistant_text,
                        EndReason::Error,
                        modified_paths,
                        loop_detected,
                        usage,
                        tool_calls,
                        tool_failures,
                        Some(err.to_string()),
                    );
                }
            };

            usage.prompt_tokens += result.usage.prompt_tokens;
            usage.completion_tokens += result.usage.completion_tokens;

            if !result.text.is_empty() {
                if !assistant_text.is_empty() {
                    assistant_text.push('\n');
                }
                assistant_text.push_str(&result.text);
            }

            // Record the assistant message (text + tool intents) as emitted.
            let mut content = Vec::new();
            if !result.text.is_empty() {
                content.push(Content::Text {
                    text: result.text.clone(),
                });
            }
            for call in &result.tool_calls {
                content.push(Content::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
            if !content.is_empty() {
                ctx.append(ModelMessage {
                    role: Role::Assistant,
                    content,
                });
            }

            if result.tool_calls.is_empty() {
                events.emit(AgentEventKind::TextComplete {
                    text: result.text.clone(),
                });
                return self.finalize(
                    events,
                    assistant_text,
                    EndReason::Completed,
                    modified_paths,
                    loop_detected,
                    usage,
                    tool_calls,
                    tool_failures,
                    None,
                );
            }

            // Repetition check on the intended actions.
            for call in &result.tool_calls {
                if let Some(diagnostic) = detector.record(&call.name, &call.arguments) {
                    warn!(tool = %call.name, "loop detected: {}", diagnostic);
                    loop_detected = true;
                    ctx.append(ModelMessage::text(Role::User, diagnostic));
                }
            }

            let executed = self
                .orchestrator
                .execute_batch(&result.tool_calls, events, cancel)
                .await;

            // Append results in emission order, one tool message per call.
            for call in &executed {
                ctx.append(ModelMessage {
                    role: Role::Tool,
                    content: vec![Content::ToolResult {
                        tool_use_id: call.call.id.clone(),
                        output: call.context_output.clone(),
                        is_error: if call.result.is_error {
                            Some(true)
                        } else {
                            None
                        },
                    }],
                });
                modified_paths.extend(call.result.modified_paths.iter().cloned());
                tool_calls += 1;
                if call.result.is_error {
                    tool_failures += 1;
                }
            }

            let pairs: Vec<_> = executed
                .iter()
                .map(|e| (e.call.clone(), e.result.clone()))
                .collect();
            if let Some(diagnostic) = detect_repeated_failures(&mut failure_signatures, &pairs) {
                warn!(round, "fail-fast: {}", diagnostic);
                events.emit(AgentEventKind::AgentError {
                    error: diagnostic.clone(),
                    code: "repeated_tool_failure".to_string(),
                    trace_id: new_trace_id(),
                });
                return self.finalize(
                    events,
                    assistant_text,
                    EndReason::Error,
                    modified_paths,
                    loop_detected,
                    usage,
                    tool_calls,
                    tool_failures,
                    Some(diagnostic),
                );
            }

            if cancel.is_cancelled() {
                return self.finalize(
                    events,
                    assistant_text,
                    EndReason::Cancelled,
                    modified_paths,
                    loop_detected,
                    usage,
                    tool_calls,
                    tool_failures,
                    None,
                );
            }
        }

        // Tool budget exhausted: leave a system observation for the next turn.
        ctx.append(ModelMessage::text(
            Role::System,
            format!(
                "Tool budget exhausted: {} tool rounds were used in one turn without \
                 reaching a final answer.",
                self.max_tool_iterations
            ),
        ));
        self.finalize(
            events,
            assistant_text,
            EndReason::ToolBudgetExhausted,
            modified_paths,
            loop_detected,
            usage,
            tool_calls,
            tool_failures,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        events: &EventStream,
        assistant_text: String,
        end_reason: EndReason,
        modified_paths: Vec<String>,
        loop_detected: bool,
        usage: Usage,
        tool_calls: u32,
        tool_failures: u32,
        error: Option<String>,
    ) -> TurnOutcome {
        events.emit(AgentEventKind::AgentEnd { reason: end_reason });
        TurnOutcome {
            assistant_text,
            end_reason,
            modified_paths,
            loop_detected,
            usage,
            tool_calls,
            tool_failures,
            error,
        }
    }
}
