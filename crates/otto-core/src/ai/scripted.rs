//! Deterministic in-process provider.
//!
//! Serves a queue of scripted responses. Used by the test suites and by
//! `otto run --dry-run` to exercise the full loop without network access.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::provider::ChatProvider;
use super::types::{AiTool, AiToolCall, DoneReason, ModelMessage, StreamPart, Usage};

/// One scripted assistant turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub text: String,
    pub tool_calls: Vec<AiToolCall>,
    pub usage: Usage,
}

impl ScriptedResponse {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let usage = Usage {
            prompt_tokens: 50,
            completion_tokens: text.len() / 4 + 1,
        };
        Self {
            text,
            tool_calls: Vec::new(),
            usage,
        }
    }

    pub fn with_tool_call(mut self, id: &str, name: &str, arguments: Value) -> Self {
        self.tool_calls.push(AiToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        });
        self
    }
}

/// Provider that replays scripted responses in order. When the script is
/// exhausted it keeps returning the last response, so open-ended loops stay
/// deterministic.
pub struct ScriptedProvider {
    responses: Mutex<Vec<ScriptedResponse>>,
    cursor: AtomicU32,
    leading_failures: AtomicU32,
    pub calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            cursor: AtomicU32::new(0),
            leading_failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` calls with a transient error before serving the
    /// script. Exercises the driver's retry path.
    pub fn with_leading_failures(self, n: u32) -> Self {
        self.leading_failures.store(n, Ordering::SeqCst);
        self
    }

    fn next_response(&self) -> Option<ScriptedResponse> {
        let responses = self.responses.lock().expect("script poisoned");
        if responses.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        Some(responses[index.min(responses.len() - 1)].clone())
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat_completion(
        &self,
        _messages: &[ModelMessage],
        _tools: &[AiTool],
        _cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        if self
            .leading_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let _ = tx.send(StreamPart::Error {
                error: "scripted transient failure".to_string(),
                transient: true,
            });
            return Ok(rx);
        }

        let Some(response) = self.next_response() else {
            let _ = tx.send(StreamPart::Done {
                reason: DoneReason::Stop,
            });
            return Ok(rx);
        };

        // Stream the text in two deltas so consumers see real streaming.
        if !response.text.is_empty() {
            let mid = response.text.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|&i| response.text.is_char_boundary(i))
                .unwrap_or(0);
            let (head, tail) = response.text.split_at(mid);
            for part in [head, tail] {
                if !part.is_empty() {
                    let _ = tx.send(StreamPart::TextDelta {
                        delta: part.to_string(),
                    });
                }
            }
        }

        for call in &response.tool_calls {
            let _ = tx.send(StreamPart::ToolCallStart {
                id: call.id.clone(),
                name: call.name.clone(),
            });
            let _ = tx.send(StreamPart::ToolCallComplete {
                tool_call: call.clone(),
            });
        }

        let _ = tx.send(StreamPart::Usage {
            usage: response.usage,
        });
        let _ = tx.send(StreamPart::Done {
            reason: if response.tool_calls.is_empty() {
                DoneReason::Stop
            } else {
                DoneReason::ToolCalls
            },
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_repeats_last() {
        let provider = ScriptedProvider::new(vec![
            ScriptedResponse::new("first"),
            ScriptedResponse::new("second"),
        ]);
        let cancel = CancellationToken::new();

        for expected in ["first", "second", "second"] {
            let mut rx = provider.chat_completion(&[], &[], &cancel).await.unwrap();
            let mut text = String::new();
            while let Some(part) = rx.recv().await {
                if let StreamPart::TextDelta { delta } = part {
                    text.push_str(&delta);
                }
            }
            assert_eq!(text, expected);
        }
    }
}
