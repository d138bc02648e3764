//! The LLM driver.
//!
//! Consumes a context snapshot, drives one streaming provider call, forwards
//! text deltas to the event stream in arrival order, and returns the
//! accumulated result. The driver never mutates context. Transient provider
//! failures are retried with backoff under the process-wide retry budget;
//! mid-stream failures after content has arrived are not retried.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::events::{AgentEventKind, EventStream};

use super::provider::ChatProvider;
use super::retry::{with_retry, RetryBudget, RetryConfig};
use super::types::{AiTool, AiToolCall, DoneReason, ModelMessage, StreamPart, Usage};

/// No-data watchdog on the provider stream.
const STREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Accumulated result of one provider call.
#[derive(Debug, Clone)]
pub struct DriveResult {
    pub text: String,
    pub tool_calls: Vec<AiToolCall>,
    pub usage: Usage,
    pub done: DoneReason,
}

pub struct LlmDriver {
    provider: Arc<dyn ChatProvider>,
    retry: RetryConfig,
    budget: Arc<RetryBudget>,
}

impl LlmDriver {
    pub fn new(provider: Arc<dyn ChatProvider>, budget: Arc<RetryBudget>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            budget,
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run one streaming call over the given snapshot.
    pub async fn drive(
        &self,
        context_view: &[ModelMessage],
        tools: &[AiTool],
        events: &EventStream,
        cancel: &CancellationToken,
    ) -> Result<DriveResult> {
        with_retry(&self.retry, &self.budget, || {
            self.drive_once(context_view, tools, events, cancel)
        })
        .await
    }

    async fn drive_once(
        &self,
        context_view: &[ModelMessage],
        tools: &[AiTool],
        events: &EventStream,
        cancel: &CancellationToken,
    ) -> Result<DriveResult> {
        let mut rx = self
            .provider
            .chat_completion(context_view, tools, cancel)
            .await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = Usage::default();
        let mut done = DoneReason::Stop;

        loop {
            let part = tokio::select! {
                part = tokio::time::timeout(STREAM_TIMEOUT, rx.recv()) => {
                    match part {
                        Ok(Some(part)) => part,
                        Ok(None) => break,
                        Err(_) => {
                            return Err(EngineError::LlmTransient(format!(
                                "stream stalled: no data for {}s",
                                STREAM_TIMEOUT.as_secs()
                            )));
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("drive cancelled mid-stream");
                    return Err(EngineError::Cancelled);
                }
            };

            match part {
                StreamPart::TextDelta { delta } => {
                    text.push_str(&delta);
                    events.emit(AgentEventKind::TextDelta { delta });
                }
                StreamPart::ToolCallStart { .. } => {}
                StreamPart::ToolCallComplete { tool_call } => tool_calls.push(tool_call),
                StreamPart::Usage { usage: u } => usage = u,
                StreamPart::Done { reason } => {
                    done = reason;
                    break;
                }
                StreamPart::Error { error, transient } => {
                    // A failure before any content is safe to retry; once the
                    // consumer has seen deltas the call is not idempotent.
                    let untouched = text.is_empty() && tool_calls.is_empty();
                    return if transient && untouched {
                        Err(EngineError::LlmTransient(error))
                    } else {
                        Err(EngineError::LlmFatal(error))
                    };
                }
            }
        }

        if done == DoneReason::Stop && !tool_calls.is_empty() {
            done = DoneReason::ToolCalls;
        }

        debug!(
            text_len = text.len(),
            tool_calls = tool_calls.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "drive complete"
        );

        Ok(DriveResult {
            text,
            tool_calls,
            usage,
            done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::scripted::{ScriptedProvider, ScriptedResponse};
    use serde_json::json;

    #[tokio::test]
    async fn accumulates_text_and_tool_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedResponse::new(
            "working on it",
        )
        .with_tool_call("call_1", "read", json!({"path": "a.txt"}))]));
        let driver = LlmDriver::new(provider, Arc::new(RetryBudget::default()));
        let events = EventStream::new("s1");
        let cancel = CancellationToken::new();

        let result = driver.drive(&[], &[], &events, &cancel).await.unwrap();
        assert_eq!(result.text, "working on it");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.done, DoneReason::ToolCalls);
    }

    #[tokio::test]
    async fn text_deltas_are_forwarded_to_events() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedResponse::new("hello")]));
        let driver = LlmDriver::new(provider, Arc::new(RetryBudget::default()));
        let events = EventStream::new("s1");
        let cancel = CancellationToken::new();

        driver.drive(&[], &[], &events, &cancel).await.unwrap();

        let history = events.history();
        let streamed: String = history
            .iter()
            .filter_map(|e| match &e.kind {
                AgentEventKind::TextDelta { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "hello");
    }

    #[tokio::test]
    async fn transient_error_before_content_is_retried() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![ScriptedResponse::new("recovered")])
                .with_leading_failures(2),
        );
        let driver = LlmDriver::new(provider, Arc::new(RetryBudget::new(10, 100.0)))
            .with_retry_config(RetryConfig {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            });
        let events = EventStream::new("s1");
        let cancel = CancellationToken::new();

        let result = driver.drive(&[], &[], &events, &cancel).await.unwrap();
        assert_eq!(result.text, "recovered");
    }
}
