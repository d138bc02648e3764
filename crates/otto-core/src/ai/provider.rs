//! Provider adapters.
//!
//! The engine depends only on `ChatProvider`: a streaming
//! `chat_completion(messages, tools)` that yields text deltas, discrete
//! tool-call intents with ids, and a usage record, terminating with a done
//! reason. `HttpProvider` adapts an OpenAI-compatible SSE endpoint to that
//! surface; anything provider-specific stays behind this trait.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

use super::retry::classify_provider_error;
use super::types::{AiTool, AiToolCall, Content, DoneReason, ModelMessage, Role, StreamPart, Usage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Minimum provider surface the driver adapts.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a streaming chat completion. The receiver ends with
    /// `StreamPart::Done` on success or `StreamPart::Error` on failure.
    async fn chat_completion(
        &self,
        messages: &[ModelMessage],
        tools: &[AiTool],
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>>;
}

/// OpenAI-compatible chat-completions adapter over SSE.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn build_body(&self, messages: &[ModelMessage], tools: &[AiTool]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": convert_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !tools.is_empty() {
            let tool_specs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tool_specs);
        }

        body
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    async fn chat_completion(
        &self,
        messages: &[ModelMessage],
        tools: &[AiTool],
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>> {
        let body = self.build_body(messages, tools);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_provider_error(None, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_provider_error(
                Some(status.as_u16()),
                format!("provider returned {}: {}", status, text),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = response.bytes_stream();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            tokio::pin!(stream);

            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => {
                        debug!("chat completion stream cancelled");
                        break;
                    }
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for part in parser.feed(&bytes) {
                            let terminal = matches!(
                                part,
                                StreamPart::Done { .. } | StreamPart::Error { .. }
                            );
                            if tx.send(part).is_err() || terminal {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(StreamPart::Error {
                            error: format!("stream read error: {}", e),
                            transient: true,
                        });
                        return;
                    }
                    None => break,
                }
            }

            // Stream ended without an explicit [DONE]; flush what we have.
            for part in parser.finish() {
                if tx.send(part).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

fn convert_messages(messages: &[ModelMessage]) -> Vec<Value> {
    let mut converted = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::Tool => {
                for block in &message.content {
                    if let Content::ToolResult {
                        tool_use_id,
                        output,
                        ..
                    } = block
                    {
                        converted.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": output,
                        }));
                    }
                }
            }
            Role::Assistant => {
                let text = message.text_content();
                let calls = message.tool_calls();
                let mut entry = json!({"role": "assistant"});
                entry["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                if !calls.is_empty() {
                    entry["tool_calls"] = Value::Array(
                        calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": {
                                        "name": c.name,
                                        "arguments": c.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                converted.push(entry);
            }
            Role::System | Role::User => {
                let role = if message.role == Role::System {
                    "system"
                } else {
                    "user"
                };
                converted.push(json!({
                    "role": role,
                    "content": message.text_content(),
                }));
            }
        }
    }

    converted
}

/// Incremental SSE parser for chat-completion chunks.
struct SseParser {
    buffer: String,
    partial_calls: Vec<PartialCall>,
    finish_reason: Option<DoneReason>,
    usage: Option<Usage>,
    done_sent: bool,
}

struct PartialCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            partial_calls: Vec::new(),
            finish_reason: None,
            usage: None,
            done_sent: false,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamPart> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut parts = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                parts.extend(self.terminal_parts());
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => parts.extend(self.process_chunk(&chunk)),
                Err(e) => warn!("unparseable SSE chunk: {}", e),
            }
        }

        parts
    }

    fn finish(&mut self) -> Vec<StreamPart> {
        self.terminal_parts()
    }

    fn process_chunk(&mut self, chunk: &Value) -> Vec<StreamPart> {
        let mut parts = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let usage = Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as usize,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as usize,
            };
            self.usage = Some(usage);
            parts.push(StreamPart::Usage { usage });
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return parts;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                if !text.is_empty() {
                    parts.push(StreamPart::TextDelta {
                        delta: text.to_string(),
                    });
                }
            }

            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let index = call["index"].as_u64().unwrap_or(0) as usize;
                    while self.partial_calls.len() <= index {
                        self.partial_calls.push(PartialCall {
                            id: String::new(),
                            name: String::new(),
                            arguments: String::new(),
                            started: false,
                        });
                    }
                    let partial = &mut self.partial_calls[index];

                    if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                        partial.id = id.to_string();
                    }
                    if let Some(name) = call.pointer("/function/name").and_then(|n| n.as_str()) {
                        partial.name.push_str(name);
                    }
                    if let Some(args) =
                        call.pointer("/function/arguments").and_then(|a| a.as_str())
                    {
                        partial.arguments.push_str(args);
                    }

                    if !partial.started && !partial.name.is_empty() {
                        partial.started = true;
                        parts.push(StreamPart::ToolCallStart {
                            id: partial.id.clone(),
                            name: partial.name.clone(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(match reason {
                "tool_calls" => DoneReason::ToolCalls,
                "length" => DoneReason::Length,
                _ => DoneReason::Stop,
            });
        }

        parts
    }

    fn terminal_parts(&mut self) -> Vec<StreamPart> {
        if self.done_sent {
            return Vec::new();
        }
        self.done_sent = true;

        let mut parts = Vec::new();
        for partial in self.partial_calls.drain(..) {
            let arguments = if partial.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&partial.arguments).unwrap_or_else(|e| {
                    warn!(
                        tool = %partial.name,
                        "tool call arguments were not valid JSON: {}", e
                    );
                    json!({})
                })
            };
            parts.push(StreamPart::ToolCallComplete {
                tool_call: AiToolCall {
                    id: partial.id,
                    name: partial.name,
                    arguments,
                },
            });
        }

        parts.push(StreamPart::Done {
            reason: self.finish_reason.unwrap_or(DoneReason::Stop),
        });
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut SseParser, lines: &[&str]) -> Vec<StreamPart> {
        let mut parts = Vec::new();
        for line in lines {
            parts.extend(parser.feed(format!("{}\n", line).as_bytes()));
        }
        parts
    }

    #[test]
    fn parses_text_deltas_and_done() {
        let mut parser = SseParser::new();
        let parts = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                "data: [DONE]",
            ],
        );

        assert!(matches!(&parts[0], StreamPart::TextDelta { delta } if delta == "Hel"));
        assert!(matches!(&parts[1], StreamPart::TextDelta { delta } if delta == "lo"));
        assert!(matches!(
            parts.last().unwrap(),
            StreamPart::Done {
                reason: DoneReason::Stop
            }
        ));
    }

    #[test]
    fn accumulates_tool_call_fragments() {
        let mut parser = SseParser::new();
        let parts = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a.txt\"}"}}]},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );

        let complete = parts
            .iter()
            .find_map(|p| match p {
                StreamPart::ToolCallComplete { tool_call } => Some(tool_call.clone()),
                _ => None,
            })
            .expect("tool call complete");
        assert_eq!(complete.id, "call_1");
        assert_eq!(complete.name, "read");
        assert_eq!(complete.arguments["path"], "a.txt");
        assert!(matches!(
            parts.last().unwrap(),
            StreamPart::Done {
                reason: DoneReason::ToolCalls
            }
        ));
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let mut parser = SseParser::new();
        let parts = feed_all(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"x","arguments":"{broken"}}]},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        let complete = parts
            .iter()
            .find_map(|p| match p {
                StreamPart::ToolCallComplete { tool_call } => Some(tool_call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete.arguments, serde_json::json!({}));
    }

    #[test]
    fn converts_tool_result_messages() {
        let messages = vec![ModelMessage {
            role: Role::Tool,
            content: vec![Content::ToolResult {
                tool_use_id: "call_9".to_string(),
                output: "done".to_string(),
                is_error: None,
            }],
        }];
        let converted = convert_messages(&messages);
        assert_eq!(converted[0]["role"], "tool");
        assert_eq!(converted[0]["tool_call_id"], "call_9");
    }

    #[test]
    fn usage_chunk_is_surfaced() {
        let mut parser = SseParser::new();
        let parts = feed_all(
            &mut parser,
            &[r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#],
        );
        assert!(matches!(
            parts[0],
            StreamPart::Usage {
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5
                }
            }
        ));
    }
}
