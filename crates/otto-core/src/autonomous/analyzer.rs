//! Response analysis.
//!
//! Parses the final assistant text of a turn for completion indicators, the
//! exit signal, errors, permission denials, and modified-file hints. The
//! structured status block is authoritative when present; free text fills in
//! the rest. Analysis is a pure function of the input text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on counted completion indicators.
const MAX_COMPLETION_INDICATORS: u32 = 10;

/// Bound on the modified-files list; oldest entries drop first.
const MAX_MODIFIED_FILES: usize = 100;

static STATUS_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap());

static EXIT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\[EXIT\]",
        r"(?i)EXIT_SIGNAL:\s*true",
        r"(?i)(?:^|[.!?]\s+)(?:project|task|implementation)(?:\s+is)?\s+complete(?:\s|$|[.!?])",
        r"(?i)all\s+(?:tasks|features|requirements)\s+complete",
        r"(?i)no\s+(?:further|more)\s+(?:work|changes|modifications)\s+(?:needed|required)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("exit pattern"))
    .collect()
});

static COMPLETION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\[DONE\]",
        r"\[COMPLETE\]",
        r"(?i)(?:feature|task|phase)\s+complete",
        r"(?i)task\s+completed",
        r"(?i)successfully\s+(?:implemented|completed|finished)",
        r"(?i)all\s+tests?\s+(?:are\s+)?passing",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("completion pattern"))
    .collect()
});

static PERMISSION_DENIAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)permission\s+denied",
        r"(?i)access\s+denied",
        r"(?i)not\s+authorized",
        r"(?i)\bforbidden\b",
        r"(?i)approval\s+denied",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("denial pattern"))
    .collect()
});

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?m)^\s*(?i:error):",
        r"\[ERROR\]",
        r"(?i)error occurred",
        r"(?i)failed with error",
        r"(?i)\bexception\b",
        r"(?i)\bfatal\b",
        r"\bTraceback\b",
        r"(?i)\bpanicked at\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("error pattern"))
    .collect()
});

/// Lines like `"has_errors": false` are JSON fields, not error reports.
static JSON_ERROR_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"[^"]*error[^"]*":\s*(?:false|0|\[\]|null)"#).unwrap());

static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)session[_-]?id[:\s]+([A-Za-z0-9][\w-]{7,})").unwrap());

static MODIFIED_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:modified|created|updated|wrote|edited)\b[:\s]+`?([\w][\w./\\-]*\.\w{1,6})`?")
        .unwrap()
});

/// What the analyzer found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseAnalysis {
    /// A structured status block parsed cleanly.
    pub parsed_json: bool,
    pub exit_signal: bool,
    pub completion_indicators: u32,
    pub has_errors: bool,
    pub error_count: u32,
    pub permission_denied: bool,
    pub session_id_hint: Option<String>,
    pub files_modified: Vec<String>,
    pub output_length: usize,
    pub status: String,
    /// 0-100 score for how trustworthy the completion claim looks.
    pub confidence: u32,
}

/// Analyzer configuration.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Indicators required before "complete" is believed.
    pub min_completion_indicators: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_completion_indicators: 2,
        }
    }
}

pub struct ResponseAnalyzer {
    config: AnalyzerConfig,
}

impl Default for ResponseAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

impl ResponseAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze one assistant response.
    pub fn analyze(&self, response: &str) -> ResponseAnalysis {
        let mut analysis = ResponseAnalysis {
            output_length: response.chars().count(),
            ..Default::default()
        };

        // Structured parse first; the block is authoritative for the fields
        // it carries and is masked out of the free-text scans.
        let mut free_text = response.to_string();
        if let Some(captures) = STATUS_BLOCK.captures(response) {
            let raw = captures.get(1).expect("capture group").as_str();
            if let Ok(data) = serde_json::from_str::<Value>(raw) {
                analysis.parsed_json = true;
                apply_structured_block(&data, &mut analysis);
                free_text = free_text.replace(captures.get(0).unwrap().as_str(), "");
            }
        }

        // Exit signal.
        if !analysis.exit_signal {
            analysis.exit_signal = EXIT_PATTERNS.iter().any(|p| p.is_match(&free_text));
        }

        // Completion indicators, capped.
        let mut indicators = analysis.completion_indicators;
        for pattern in COMPLETION_PATTERNS.iter() {
            indicators += pattern.find_iter(&free_text).count() as u32;
        }
        analysis.completion_indicators = indicators.min(MAX_COMPLETION_INDICATORS);

        // Two-stage error scan: drop JSON-field lines, then count matches.
        let (text_errors, count) = detect_errors(&free_text);
        analysis.has_errors |= text_errors;
        analysis.error_count += count;

        // Permission denials.
        analysis.permission_denied |= PERMISSION_DENIAL_PATTERNS
            .iter()
            .any(|p| p.is_match(&free_text));

        // Session-id hint.
        if analysis.session_id_hint.is_none() {
            analysis.session_id_hint = SESSION_ID_PATTERN
                .captures(&free_text)
                .map(|c| c[1].to_string());
        }

        // Modified files from free text, unioned after any structured list.
        for captures in MODIFIED_FILE_PATTERN.captures_iter(&free_text) {
            push_file(&mut analysis.files_modified, captures[1].to_string());
        }

        analysis.confidence = confidence(&analysis);
        analysis.status = derive_status(&analysis, self.config.min_completion_indicators);
        analysis
    }
}

fn apply_structured_block(data: &Value, analysis: &mut ResponseAnalysis) {
    let exit = data.get("exit_signal").or_else(|| data.get("EXIT_SIGNAL"));
    if matches!(exit, Some(Value::Bool(true)))
        || matches!(exit.and_then(|v| v.as_str()), Some("true") | Some("True"))
    {
        analysis.exit_signal = true;
    }

    if let Some(status) = data.get("status").and_then(|s| s.as_str()) {
        analysis.status = status.to_lowercase();
        if matches!(
            analysis.status.as_str(),
            "complete" | "completed" | "done" | "success"
        ) {
            analysis.completion_indicators += 1;
        }
    }

    let errors = data.get("errors").or_else(|| data.get("has_errors"));
    match errors {
        Some(Value::Bool(true)) => {
            analysis.has_errors = true;
            analysis.error_count += 1;
        }
        Some(Value::Array(items)) if !items.is_empty() => {
            analysis.has_errors = true;
            analysis.error_count += items.len() as u32;
        }
        _ => {}
    }

    if let Some(files) = data.get("files_modified").and_then(|f| f.as_array()) {
        for file in files {
            if let Some(path) = file.as_str() {
                push_file(&mut analysis.files_modified, path.to_string());
            }
        }
    }

    if let Some(id) = data
        .get("session_id")
        .or_else(|| data.get("sessionId"))
        .and_then(|v| v.as_str())
    {
        analysis.session_id_hint = Some(id.to_string());
    }
}

fn detect_errors(text: &str) -> (bool, u32) {
    let filtered: String = text
        .lines()
        .filter(|line| !JSON_ERROR_FIELD.is_match(line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut count = 0u32;
    for pattern in ERROR_PATTERNS.iter() {
        count += pattern.find_iter(&filtered).count() as u32;
    }
    (count > 0, count)
}

fn push_file(files: &mut Vec<String>, path: String) {
    if files.contains(&path) {
        return;
    }
    files.push(path);
    if files.len() > MAX_MODIFIED_FILES {
        files.remove(0);
    }
}

fn confidence(analysis: &ResponseAnalysis) -> u32 {
    let mut score = 0;
    if analysis.exit_signal {
        score += 50;
    }
    score += (analysis.completion_indicators * 20).min(30);
    if analysis.parsed_json {
        score += 20;
    }
    score.min(100)
}

fn derive_status(analysis: &ResponseAnalysis, min_indicators: u32) -> String {
    if analysis.permission_denied {
        "permission_denied".to_string()
    } else if analysis.exit_signal && analysis.completion_indicators >= min_indicators {
        "complete".to_string()
    } else if analysis.has_errors {
        "error".to_string()
    } else if analysis.completion_indicators > 0 {
        "in_progress".to_string()
    } else if !analysis.status.is_empty() {
        analysis.status.clone()
    } else {
        "working".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(text: &str) -> ResponseAnalysis {
        ResponseAnalyzer::default().analyze(text)
    }

    #[test]
    fn empty_text_yields_neutral_analysis() {
        let analysis = analyze("");
        assert!(!analysis.exit_signal);
        assert_eq!(analysis.completion_indicators, 0);
        assert!(!analysis.has_errors);
        assert!(!analysis.permission_denied);
        assert_eq!(analysis.output_length, 0);
        assert_eq!(analysis.status, "working");
    }

    #[test]
    fn structured_block_is_authoritative() {
        let text = r#"Work finished.

```json
{"exit_signal": true, "status": "complete", "summary": "all done", "files_modified": ["src/lib.rs"]}
```
"#;
        let analysis = analyze(text);
        assert!(analysis.parsed_json);
        assert!(analysis.exit_signal);
        assert!(analysis.completion_indicators >= 1);
        assert_eq!(analysis.files_modified, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn dual_gate_scenario_text_passes() {
        // Scenario 1 shape: marker plus structured block.
        let text = "[DONE] task complete\n```json\n{\"exit_signal\": true, \"status\": \"complete\", \"summary\": \"noop\"}\n```";
        let analysis = analyze(text);
        assert!(analysis.exit_signal);
        assert!(analysis.completion_indicators >= 2);
        assert_eq!(analysis.status, "complete");
    }

    #[test]
    fn free_text_exit_markers_are_recognized() {
        assert!(analyze("finishing up\nEXIT_SIGNAL: true").exit_signal);
        assert!(analyze("[EXIT]").exit_signal);
        assert!(!analyze("still working on it").exit_signal);
    }

    #[test]
    fn error_word_inside_json_field_does_not_count() {
        let text = "tool output:\n\"is_error\": false\n\"error_count\": 0\nall good";
        let analysis = analyze(text);
        assert!(!analysis.has_errors);
    }

    #[test]
    fn real_errors_are_counted() {
        let text = "Error: could not compile\nthread panicked at src/main.rs";
        let analysis = analyze(text);
        assert!(analysis.has_errors);
        assert!(analysis.error_count >= 2);
        assert_eq!(analysis.status, "error");
    }

    #[test]
    fn permission_denials_are_detected() {
        let analysis = analyze("The operation failed: permission denied for /etc");
        assert!(analysis.permission_denied);
        assert_eq!(analysis.status, "permission_denied");
    }

    #[test]
    fn completion_indicators_are_capped() {
        let text = "[DONE] ".repeat(50);
        let analysis = analyze(&text);
        assert_eq!(analysis.completion_indicators, 10);
    }

    #[test]
    fn session_id_hint_is_extracted() {
        let analysis = analyze("resuming with session_id: abc123-def456");
        assert_eq!(analysis.session_id_hint.as_deref(), Some("abc123-def456"));
    }

    #[test]
    fn modified_files_are_inferred_from_text() {
        let analysis = analyze("I modified src/main.rs and created tests/e2e.rs");
        assert!(analysis
            .files_modified
            .contains(&"src/main.rs".to_string()));
        assert!(analysis
            .files_modified
            .contains(&"tests/e2e.rs".to_string()));
    }

    #[test]
    fn modified_files_are_bounded() {
        let mut text = String::new();
        for i in 0..150 {
            text.push_str(&format!("modified file_{:03}.rs\n", i));
        }
        let analysis = analyze(&text);
        assert_eq!(analysis.files_modified.len(), 100);
        // Oldest dropped.
        assert!(!analysis
            .files_modified
            .contains(&"file_000.rs".to_string()));
        assert!(analysis
            .files_modified
            .contains(&"file_149.rs".to_string()));
    }

    #[test]
    fn analysis_is_deterministic() {
        let text = "task complete [DONE]\nmodified a.rs\nmodified b.rs";
        let first = analyze(text);
        let second = analyze(text);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn confidence_reflects_signals() {
        let weak = analyze("still going");
        assert_eq!(weak.confidence, 0);

        let strong = analyze(
            "[DONE] task complete\n```json\n{\"exit_signal\": true, \"status\": \"complete\"}\n```",
        );
        assert_eq!(strong.confidence, 100);
    }
}
