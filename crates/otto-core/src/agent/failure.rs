//! Repeated tool failure detection.
//!
//! Tracks tool error signatures across rounds and triggers a fail-fast when
//! the same tool keeps failing the same way, preventing infinite retry loops.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::ai::types::AiToolCall;
use crate::tools::registry::ToolResult;

/// Stop after this many identical failures.
pub const REPEATED_FAILURE_THRESHOLD: usize = 2;

/// Check a round of results for repeated failures. Returns a diagnostic when
/// the same tool+error signature has been seen `REPEATED_FAILURE_THRESHOLD`
/// or more times. Any success clears all counters (the agent recovered).
pub fn detect_repeated_failures(
    counters: &mut HashMap<String, usize>,
    executed: &[(AiToolCall, ToolResult)],
) -> Option<String> {
    let mut saw_success = false;
    let mut diagnostic = None;

    for (call, result) in executed {
        if !result.is_error {
            saw_success = true;
            continue;
        }

        let (error_code, fingerprint) = extract_error_signature(&result.output);
        let signature = format!(
            "{}|{}|{}|{}",
            call.name,
            error_code,
            fingerprint,
            hash_arguments(&call.arguments)
        );
        let count = counters
            .entry(signature)
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if *count >= REPEATED_FAILURE_THRESHOLD && diagnostic.is_none() {
            diagnostic = Some(format!(
                "Stopping tool loop: '{}' failed {} times with the same '{}' error. \
                 A different strategy is required.",
                call.name, *count, error_code
            ));
        }
    }

    if saw_success {
        counters.clear();
    }

    diagnostic
}

fn hash_arguments(arguments: &serde_json::Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    arguments.to_string().hash(&mut hasher);
    hasher.finish()
}

fn extract_error_signature(output: &str) -> (String, String) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(output) {
        if let Some(error) = value.get("error") {
            if let Some(error_obj) = error.as_object() {
                let message = error_obj
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let code = error_obj
                    .get("code")
                    .and_then(|v| v.as_str())
                    .filter(|c| !c.is_empty())
                    .map(|c| c.to_ascii_lowercase())
                    .unwrap_or_else(|| "tool_error".to_string());
                return (code, normalize_fingerprint(message));
            }
            if let Some(message) = error.as_str() {
                return ("tool_error".to_string(), normalize_fingerprint(message));
            }
        }
    }

    ("tool_error".to_string(), normalize_fingerprint(output))
}

fn normalize_fingerprint(message: &str) -> String {
    let mut compact = String::new();
    for part in message.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(part);
    }
    if compact.is_empty() {
        return "unknown".to_string();
    }
    compact.make_ascii_lowercase();
    compact.chars().take(160).collect()
}
