//! Tool orchestration for one assistant turn.
//!
//! Takes the batch of tool calls the model emitted and produces one result
//! per call, in model-emission order:
//!
//! 1. Arguments are validated against the tool's schema; invalid calls become
//!    synthetic errors without reaching the handler.
//! 2. Valid calls go through the safety gate.
//! 3. Admitted calls execute under a per-call deadline. Independent calls may
//!    run concurrently up to the configured bound; calls that claim the same
//!    written path or resource key are serialized in emission order.
//! 4. Output is scrubbed, emitted once in full on the event stream, and
//!    truncated before it is handed back for the context.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ai::types::AiToolCall;
use crate::error::EngineError;
use crate::events::{AgentEventKind, EventStream};
use crate::safety::SafetyGate;
use crate::tools::registry::{ToolContext, ToolRegistry, ToolResult};
use crate::tools::schema::validate_arguments;
use crate::tools::truncation::truncate_to_tokens;

/// Grace window granted to in-flight tools after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One finished call: the original intent, the full (scrubbed) result, and
/// the truncated output destined for the context.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub call: AiToolCall,
    pub result: ToolResult,
    pub context_output: String,
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    gate: Arc<SafetyGate>,
    working_dir: PathBuf,
    parallelism: usize,
    output_token_cap: usize,
    tool_timeout: Duration,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<SafetyGate>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            gate,
            working_dir,
            parallelism: 1,
            output_token_cap: 2_500,
            tool_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_output_token_cap(mut self, cap: usize) -> Self {
        self.output_token_cap = cap;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Execute a batch of tool calls. Results come back in emission order,
    /// one per call, including synthetic results for calls that never ran.
    pub async fn execute_batch(
        &self,
        calls: &[AiToolCall],
        events: &EventStream,
        cancel: &CancellationToken,
    ) -> Vec<ExecutedCall> {
        let waves = self.plan_waves(calls);
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];

        for wave in waves {
            if cancel.is_cancelled() {
                break;
            }

            let mut handles = Vec::with_capacity(wave.len());
            let semaphore = Arc::new(tokio::sync::Semaphore::new(self.parallelism));

            for position in wave {
                let call = calls[position].clone();
                let semaphore = semaphore.clone();
                let events_seq = events.emit(AgentEventKind::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                debug!(tool = %call.name, id = %call.id, seq = events_seq, "tool call start");

                let registry = self.registry.clone();
                let gate = self.gate.clone();
                let working_dir = self.working_dir.clone();
                let timeout = self.tool_timeout;
                let cancel = cancel.child_token();

                handles.push((
                    position,
                    tokio::spawn(async move {
                        // The semaphore lives as long as the wave; acquire
                        // cannot observe it closed.
                        let _permit = semaphore.acquire().await.expect("semaphore closed");
                        run_single(&registry, &gate, &working_dir, timeout, cancel, call).await
                    }),
                ));
            }

            for (position, handle) in handles {
                let result = if cancel.is_cancelled() {
                    // In-flight work gets the grace window; whatever arrives
                    // is still recorded for log fidelity.
                    match tokio::time::timeout(CANCEL_GRACE, handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => {
                            warn!("tool task panicked: {}", join_err);
                            ToolResult::error(format!("tool task failed: {}", join_err))
                        }
                        Err(_) => ToolResult::from_engine_error(&EngineError::Cancelled),
                    }
                } else {
                    match handle.await {
                        Ok(result) => result,
                        Err(join_err) => {
                            warn!("tool task panicked: {}", join_err);
                            ToolResult::error(format!("tool task failed: {}", join_err))
                        }
                    }
                };
                results[position] = Some(result);
            }
        }

        // Emission-order assembly; calls skipped by cancellation still get a
        // result so every tool_use keeps a matching tool_result.
        let mut executed = Vec::with_capacity(calls.len());
        for (position, call) in calls.iter().enumerate() {
            let result = results[position]
                .take()
                .unwrap_or_else(|| ToolResult::from_engine_error(&EngineError::Cancelled));

            events.emit(AgentEventKind::ToolCallComplete {
                id: call.id.clone(),
                name: call.name.clone(),
                output: result.output.clone(),
                is_error: result.is_error,
            });

            let context_output = truncate_to_tokens(&result.output, self.output_token_cap);
            executed.push(ExecutedCall {
                call: call.clone(),
                result,
                context_output,
            });
        }

        executed
    }

    /// Partition calls into sequential waves such that two calls sharing a
    /// mutation claim never run in the same wave. Within a wave, order does
    /// not matter; across waves, emission order is preserved.
    fn plan_waves(&self, calls: &[AiToolCall]) -> Vec<Vec<usize>> {
        let mut wave_of: Vec<usize> = Vec::with_capacity(calls.len());
        let mut claim_wave: HashMap<String, usize> = HashMap::new();

        for call in calls {
            let claims = self.claims_for(call);
            let min_wave = claims
                .iter()
                .filter_map(|claim| claim_wave.get(claim))
                .map(|w| w + 1)
                .max()
                .unwrap_or(0);
            for claim in claims {
                claim_wave.insert(claim, min_wave);
            }
            wave_of.push(min_wave);
        }

        let wave_count = wave_of.iter().map(|w| w + 1).max().unwrap_or(0);
        let mut waves: Vec<Vec<usize>> = vec![Vec::new(); wave_count];
        for (position, wave) in wave_of.into_iter().enumerate() {
            waves[wave].push(position);
        }
        waves
    }

    /// Mutation claims for a call: paths it would write plus any resource
    /// keys the tool declares.
    fn claims_for(&self, call: &AiToolCall) -> HashSet<String> {
        let mut claims = HashSet::new();
        let Some(tool) = self.registry.get(&call.name) else {
            return claims;
        };

        for key in tool.resource_keys(&call.arguments) {
            claims.insert(format!("key:{}", key));
        }

        if tool.capabilities().writes_fs {
            if let Some(map) = call.arguments.as_object() {
                for (name, value) in map {
                    if crate::safety::paths::is_path_argument(name) {
                        if let Some(path) = value.as_str() {
                            claims.insert(format!("path:{}", path));
                        }
                    }
                }
            }
        }

        claims
    }
}

async fn run_single(
    registry: &ToolRegistry,
    gate: &SafetyGate,
    working_dir: &std::path::Path,
    timeout: Duration,
    cancel: CancellationToken,
    call: AiToolCall,
) -> ToolResult {
    let Some(tool) = registry.get(&call.name) else {
        return ToolResult::error_with_code("unknown_tool", format!("unknown tool: {}", call.name));
    };
    let capabilities = tool.capabilities();

    // Validation short-circuits before the gate.
    if let Err(violation) = validate_arguments(&call.arguments, &tool.parameters_schema()) {
        return ToolResult::invalid_parameters(violation);
    }

    if let Err(rejection) = gate.check(&call, capabilities).await {
        return ToolResult::from_engine_error(&rejection);
    }

    let mut ctx = ToolContext::new(working_dir.to_path_buf())
        .with_timeout(timeout)
        .with_cancel(cancel);

    if capabilities.executes_process {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        crate::safety::sanitize_env(&mut env);
        ctx = ctx.with_env(env);
    }

    let mut result = registry.execute(&call.name, call.arguments.clone(), &ctx).await;

    if capabilities.network && result.is_error {
        gate.record_network_failure(&call.name);
    }

    result.output = gate.scrub_output(&result.output);
    result
}
