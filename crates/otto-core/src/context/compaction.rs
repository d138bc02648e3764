//! Compaction strategies.
//!
//! Compaction replaces low-value middle messages with one synthesized summary.
//! Protected no matter what: system messages, the last-K tail, and both halves
//! of any tool-call/result pair with a retained member. The summary is
//! deterministic — a digest of what was dropped — so compaction stays a pure
//! operation on the log.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ai::types::{Content, ModelMessage, Role};

use super::{estimate_message_tokens, IndexedMessage};

/// How droppable messages are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    /// Keep the most recent messages.
    Recency,
    /// Keep tool traffic and structured content.
    Importance,
    /// Keep messages sharing vocabulary with the retained tail.
    Relevance,
    /// Weighted blend of the above.
    Hybrid,
}

/// What a compaction pass did.
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub dropped: usize,
    pub retained: usize,
    pub summary_index: u64,
}

/// Compact `messages` toward `target_tokens`. Returns the replacement log and
/// a report, or the original log untouched when nothing can be dropped.
pub(super) fn compact(
    messages: Vec<IndexedMessage>,
    strategy: CompactionStrategy,
    tail_window: usize,
    target_tokens: usize,
    next_index: &mut u64,
) -> (Vec<IndexedMessage>, Option<CompactionReport>) {
    let protected = protected_indices(&messages, tail_window);

    let mut droppable: Vec<&IndexedMessage> = messages
        .iter()
        .filter(|m| !protected.contains(&m.index))
        .collect();
    if droppable.is_empty() {
        return (messages, None);
    }

    let tail_vocabulary = tail_vocabulary(&messages, tail_window);
    let max_index = messages.last().map(|m| m.index).unwrap_or(0);

    // Lowest score drops first.
    droppable.sort_by(|a, b| {
        score(a, strategy, &tail_vocabulary, max_index)
            .partial_cmp(&score(b, strategy, &tail_vocabulary, max_index))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut total: usize = messages.iter().map(|m| m.tokens).sum();
    let mut dropped: HashSet<u64> = HashSet::new();
    for candidate in droppable {
        if total <= target_tokens {
            break;
        }
        dropped.insert(candidate.index);
        total -= candidate.tokens;
    }

    if dropped.is_empty() {
        return (messages, None);
    }

    // Pair closure: a tool pair is dropped or retained as a unit. Retention
    // wins so the prompt never loses one half of a referenced pair.
    for (call_index, result_index) in tool_pairs(&messages) {
        let call_dropped = dropped.contains(&call_index);
        let result_dropped = dropped.contains(&result_index);
        if call_dropped != result_dropped {
            dropped.remove(&call_index);
            dropped.remove(&result_index);
        }
    }

    if dropped.is_empty() {
        return (messages, None);
    }

    let dropped_messages: Vec<&IndexedMessage> = messages
        .iter()
        .filter(|m| dropped.contains(&m.index))
        .collect();
    let summary_text = synthesize_summary(&dropped_messages);

    let summary_index = *next_index;
    *next_index += 1;
    let summary_message = ModelMessage::text(Role::User, summary_text);
    let summary = IndexedMessage {
        index: summary_index,
        tokens: estimate_message_tokens(&summary_message),
        message: summary_message,
        is_summary: true,
    };

    let dropped_count = dropped.len();
    let mut result: Vec<IndexedMessage> = Vec::with_capacity(messages.len() - dropped_count + 1);
    let mut summary_inserted = false;

    for entry in messages {
        if dropped.contains(&entry.index) {
            // The summary takes the slot of the first dropped message so the
            // prefix stays in reading order.
            if !summary_inserted {
                result.push(summary.clone());
                summary_inserted = true;
            }
            continue;
        }
        result.push(entry);
    }

    let retained = result.len();
    (
        result,
        Some(CompactionReport {
            dropped: dropped_count,
            retained,
            summary_index,
        }),
    )
}

/// Indices that compaction must never drop.
fn protected_indices(messages: &[IndexedMessage], tail_window: usize) -> HashSet<u64> {
    let mut protected = HashSet::new();

    for entry in messages {
        if entry.message.role == Role::System || entry.is_summary {
            protected.insert(entry.index);
        }
    }

    let tail_start = messages.len().saturating_sub(tail_window);
    for entry in &messages[tail_start..] {
        protected.insert(entry.index);
    }

    // Close protection over tool pairs touching the tail.
    let pairs = tool_pairs(messages);
    loop {
        let before = protected.len();
        for (call_index, result_index) in &pairs {
            if protected.contains(call_index) || protected.contains(result_index) {
                protected.insert(*call_index);
                protected.insert(*result_index);
            }
        }
        if protected.len() == before {
            break;
        }
    }

    protected
}

/// (assistant tool-call index, tool result index) pairs, matched by call id.
fn tool_pairs(messages: &[IndexedMessage]) -> Vec<(u64, u64)> {
    let mut pairs = Vec::new();
    for entry in messages {
        for block in &entry.message.content {
            let Content::ToolUse { id, .. } = block else {
                continue;
            };
            let result = messages.iter().find(|m| {
                m.message.content.iter().any(|c| {
                    matches!(c, Content::ToolResult { tool_use_id, .. } if tool_use_id == id)
                })
            });
            if let Some(result) = result {
                pairs.push((entry.index, result.index));
            }
        }
    }
    pairs
}

fn tail_vocabulary(messages: &[IndexedMessage], tail_window: usize) -> HashSet<String> {
    let tail_start = messages.len().saturating_sub(tail_window);
    let mut vocabulary = HashSet::new();
    for entry in &messages[tail_start..] {
        for word in entry.message.text_content().split_whitespace() {
            let word = word.to_lowercase();
            if word.len() > 3 {
                vocabulary.insert(word);
            }
        }
    }
    vocabulary
}

/// Score one droppable message; higher keeps it longer.
fn score(
    entry: &IndexedMessage,
    strategy: CompactionStrategy,
    tail_vocabulary: &HashSet<String>,
    max_index: u64,
) -> f64 {
    let recency = if max_index == 0 {
        0.5
    } else {
        entry.index as f64 / max_index as f64
    };

    let importance = importance_score(&entry.message);
    let relevance = relevance_score(&entry.message, tail_vocabulary);

    match strategy {
        CompactionStrategy::Recency => recency,
        CompactionStrategy::Importance => importance,
        CompactionStrategy::Relevance => relevance,
        CompactionStrategy::Hybrid => relevance * 0.4 + recency * 0.35 + importance * 0.25,
    }
}

fn importance_score(message: &ModelMessage) -> f64 {
    let has_tool_traffic = message
        .content
        .iter()
        .any(|c| matches!(c, Content::ToolUse { .. } | Content::ToolResult { .. }));
    if has_tool_traffic {
        return 1.0;
    }
    match message.role {
        Role::System => 0.8,
        Role::Assistant if message.text_content().contains("```") => 0.7,
        Role::Assistant => 0.5,
        _ => 0.4,
    }
}

fn relevance_score(message: &ModelMessage, tail_vocabulary: &HashSet<String>) -> f64 {
    if tail_vocabulary.is_empty() {
        return 0.5;
    }
    let text = message.text_content().to_lowercase();
    let words: HashSet<String> = text
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(ToString::to_string)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let overlap = words.intersection(tail_vocabulary).count();
    overlap as f64 / words.len() as f64
}

/// Deterministic digest of the dropped messages.
fn synthesize_summary(dropped: &[&IndexedMessage]) -> String {
    let mut user_turns = 0usize;
    let mut assistant_turns = 0usize;
    let mut tool_names: Vec<String> = Vec::new();
    let mut excerpts: Vec<String> = Vec::new();

    for entry in dropped {
        match entry.message.role {
            Role::User => user_turns += 1,
            Role::Assistant => assistant_turns += 1,
            _ => {}
        }
        for block in &entry.message.content {
            if let Content::ToolUse { name, .. } = block {
                if !tool_names.contains(name) {
                    tool_names.push(name.clone());
                }
            }
        }
        if excerpts.len() < 6 {
            let text = entry.message.text_content();
            if let Some(line) = text.lines().find(|l| !l.trim().is_empty()) {
                let line: String = line.chars().take(100).collect();
                excerpts.push(format!("- {:?}: {}", entry.message.role, line));
            }
        }
    }

    let mut summary = format!(
        "[Conversation compacted: {} earlier messages removed ({} user, {} assistant).]",
        dropped.len(),
        user_turns,
        assistant_turns
    );
    if !tool_names.is_empty() {
        summary.push_str(&format!("\nTools used: {}.", tool_names.join(", ")));
    }
    if !excerpts.is_empty() {
        summary.push_str("\nKey moments:\n");
        summary.push_str(&excerpts.join("\n"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::super::ContextManager;
    use super::*;
    use serde_json::json;

    fn filler(text: &str) -> String {
        // Big enough that individual messages carry real token weight.
        format!("{} {}", text, "lorem ipsum dolor sit amet ".repeat(20))
    }

    fn build_context() -> ContextManager {
        let mut ctx = ContextManager::new(100, 4);
        ctx.append(ModelMessage::text(Role::System, "you are an agent"));
        for i in 0..20 {
            ctx.append(ModelMessage::text(Role::User, filler(&format!("ask {}", i))));
            ctx.append(ModelMessage::text(
                Role::Assistant,
                filler(&format!("answer {}", i)),
            ));
        }
        ctx
    }

    #[test]
    fn compaction_reduces_tokens_and_inserts_summary() {
        let mut ctx = build_context();
        let before = ctx.token_total();
        let report = ctx.compact(0).expect("compaction should run");

        assert!(ctx.token_total() < before);
        assert!(report.dropped > 0);

        let view = ctx.view();
        assert_eq!(view[0].role, Role::System);
        assert!(view
            .iter()
            .any(|m| m.text_content().contains("Conversation compacted")));
    }

    #[test]
    fn compaction_is_idempotent_without_appends() {
        let mut ctx = build_context();
        ctx.compact(0).expect("first compaction");
        let snapshot = ctx.view();
        let tokens = ctx.token_total();

        let second = ctx.compact(0);
        assert!(second.is_none());
        assert_eq!(ctx.view(), snapshot);
        assert_eq!(ctx.token_total(), tokens);
    }

    #[test]
    fn retained_indices_are_preserved_and_summary_gets_fresh_index() {
        let mut ctx = build_context();
        let last_index_before = ctx.entries().last().unwrap().index;
        let report = ctx.compact(0).unwrap();

        assert!(report.summary_index > last_index_before);
        // Every non-summary entry keeps its original index ordering.
        let indices: Vec<u64> = ctx
            .entries()
            .iter()
            .filter(|e| !e.is_summary)
            .map(|e| e.index)
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn tool_pairs_never_split() {
        let mut ctx = ContextManager::new(80, 6);
        ctx.append(ModelMessage::text(Role::System, "system"));
        ctx.append(ModelMessage::text(Role::User, filler("start")));

        // Turn 3: assistant tool call; turn 4: its result.
        ctx.append(ModelMessage {
            role: Role::Assistant,
            content: vec![Content::ToolUse {
                id: "call_3".to_string(),
                name: "read".to_string(),
                input: json!({"path": "a.txt"}),
            }],
        });
        ctx.append(ModelMessage {
            role: Role::Tool,
            content: vec![Content::ToolResult {
                tool_use_id: "call_3".to_string(),
                output: filler("contents"),
                is_error: None,
            }],
        });

        for i in 0..16 {
            ctx.append(ModelMessage::text(Role::User, filler(&format!("u{}", i))));
            ctx.append(ModelMessage::text(
                Role::Assistant,
                filler(&format!("a{}", i)),
            ));
        }

        ctx.compact(0).expect("compaction should run");

        let view = ctx.view();
        let has_call = view.iter().any(|m| {
            m.content
                .iter()
                .any(|c| matches!(c, Content::ToolUse { id, .. } if id == "call_3"))
        });
        let has_result = view.iter().any(|m| {
            m.content.iter().any(
                |c| matches!(c, Content::ToolResult { tool_use_id, .. } if tool_use_id == "call_3"),
            )
        });
        assert_eq!(has_call, has_result, "tool pair was split by compaction");
    }

    #[test]
    fn tail_window_is_retained_verbatim() {
        let mut ctx = build_context();
        let tail: Vec<ModelMessage> = ctx.view().iter().rev().take(4).rev().cloned().collect();
        ctx.compact(0).unwrap();

        let view = ctx.view();
        let kept_tail: Vec<ModelMessage> = view.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(tail, kept_tail);
    }
}
