//! Repetition detection over recent assistant actions.
//!
//! Tracks (tool name, argument hash) signatures for the last few tool calls.
//! When the same action repeats enough times in the window, the turn engine
//! injects a breaker message and the no-progress counter ticks. Detection is
//! cheap on purpose: a hash comparison per action.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Actions remembered.
const DEFAULT_WINDOW: usize = 10;
/// Identical repeats within the window that trip detection.
const DEFAULT_THRESHOLD: usize = 3;

#[derive(Debug)]
pub struct LoopDetector {
    recent: VecDeque<(u64, String)>,
    window: usize,
    threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl LoopDetector {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window),
            window,
            threshold,
        }
    }

    /// Record one assistant action. Returns a diagnostic when the same
    /// action has now been seen `threshold` times in the window.
    pub fn record(&mut self, tool_name: &str, arguments: &Value) -> Option<String> {
        let signature = Self::signature(tool_name, arguments);

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back((signature, tool_name.to_string()));

        let repeats = self
            .recent
            .iter()
            .filter(|(sig, _)| *sig == signature)
            .count();

        if repeats >= self.threshold {
            Some(format!(
                "The last {} calls to '{}' used identical arguments. Repeating the same \
                 action will not change the outcome; try a different approach.",
                repeats, tool_name
            ))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    fn signature(tool_name: &str, arguments: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        tool_name.hash(&mut hasher);
        arguments.to_string().hash(&mut hasher);
        hasher.finish()
    }
}
