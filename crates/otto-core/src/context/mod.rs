//! Context manager.
//!
//! Append-only message log with token accounting and compaction. Messages are
//! immutable after append; compaction replaces a prefix of the log with a
//! synthesized summary while preserving the system prompt, the recent tail,
//! and tool-call/result pairing.

pub mod compaction;
pub mod loop_detector;

use serde::{Deserialize, Serialize};

use crate::ai::types::{Content, ModelMessage};

pub use compaction::{CompactionReport, CompactionStrategy};
pub use loop_detector::LoopDetector;

/// Flat per-message framing overhead, in estimated tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Monotone token estimate for a text span (~4 chars per token).
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Token estimate for a whole message.
pub fn estimate_message_tokens(message: &ModelMessage) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    for block in &message.content {
        tokens += match block {
            Content::Text { text } => estimate_text_tokens(text),
            Content::ToolUse { name, input, .. } => {
                estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
            }
            Content::ToolResult { output, .. } => estimate_text_tokens(output),
        };
    }
    tokens
}

/// A message with its log position and token estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedMessage {
    pub index: u64,
    pub message: ModelMessage,
    pub tokens: usize,
    /// Set on synthesized compaction summaries.
    #[serde(default)]
    pub is_summary: bool,
}

/// Append-only conversation log with token accounting.
#[derive(Debug)]
pub struct ContextManager {
    messages: Vec<IndexedMessage>,
    next_index: u64,
    token_total: usize,
    threshold_tokens: usize,
    tail_window: usize,
    strategy: CompactionStrategy,
}

impl ContextManager {
    pub fn new(threshold_tokens: usize, tail_window: usize) -> Self {
        Self {
            messages: Vec::new(),
            next_index: 0,
            token_total: 0,
            threshold_tokens,
            tail_window,
            strategy: CompactionStrategy::Hybrid,
        }
    }

    pub fn with_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Append a message. O(1); returns its index.
    pub fn append(&mut self, message: ModelMessage) -> u64 {
        let tokens = estimate_message_tokens(&message);
        let index = self.next_index;
        self.next_index += 1;
        self.token_total += tokens;
        self.messages.push(IndexedMessage {
            index,
            message,
            tokens,
            is_summary: false,
        });
        index
    }

    /// Snapshot of the current prompt sequence.
    pub fn view(&self) -> Vec<ModelMessage> {
        self.messages.iter().map(|m| m.message.clone()).collect()
    }

    /// The indexed log, for persistence.
    pub fn entries(&self) -> &[IndexedMessage] {
        &self.messages
    }

    /// Rebuild from a persisted log.
    pub fn restore(&mut self, entries: Vec<IndexedMessage>) {
        self.next_index = entries.iter().map(|e| e.index + 1).max().unwrap_or(0);
        self.token_total = entries.iter().map(|e| e.tokens).sum();
        self.messages = entries;
    }

    pub fn token_total(&self) -> usize {
        self.token_total
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn needs_compaction(&self) -> bool {
        self.token_total > self.threshold_tokens
    }

    /// Compact if over threshold. `headroom` lowers the target so the next
    /// few appends do not immediately re-trigger. Idempotent when no message
    /// has been appended since the last call.
    pub fn compact(&mut self, headroom: usize) -> Option<CompactionReport> {
        if !self.needs_compaction() {
            return None;
        }
        let target = self.threshold_tokens.saturating_sub(headroom);

        let (messages, report) = compaction::compact(
            std::mem::take(&mut self.messages),
            self.strategy,
            self.tail_window,
            target,
            &mut self.next_index,
        );
        self.messages = messages;
        self.token_total = self.messages.iter().map(|m| m.tokens).sum();
        report
    }
}
