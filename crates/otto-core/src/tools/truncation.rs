//! Tool output truncation.
//!
//! Tool output is truncated to an approximate token cap before it enters the
//! context. The full output goes out once on the event stream and is never
//! re-fed to the model.

use crate::context::estimate_text_tokens;

/// Truncate `output` to roughly `token_cap` tokens. Output at or under the
/// cap is returned unchanged.
pub fn truncate_to_tokens(output: &str, token_cap: usize) -> String {
    let char_budget = token_cap * 4;
    let char_count = output.chars().count();
    if char_count <= char_budget {
        return output.to_string();
    }

    let byte_cut = output
        .char_indices()
        .nth(char_budget)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    let truncated = &output[..byte_cut];

    // Prefer a clean line break near the cut.
    let break_point = truncated.rfind('\n').filter(|&i| i > char_budget / 2);
    let clean = match break_point {
        Some(i) => &truncated[..i],
        None => truncated,
    };

    format!(
        "{}\n\n[... output truncated: ~{} of ~{} tokens kept ...]",
        clean,
        estimate_text_tokens(clean),
        estimate_text_tokens(output)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_at_limit_is_preserved() {
        let cap = 10;
        let exact = "a".repeat(cap * 4);
        assert_eq!(truncate_to_tokens(&exact, cap), exact);
    }

    #[test]
    fn one_char_over_is_truncated() {
        let cap = 10;
        let over = "a".repeat(cap * 4 + 1);
        let truncated = truncate_to_tokens(&over, cap);
        assert_ne!(truncated, over);
        assert!(truncated.contains("output truncated"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let cap = 2;
        let text = "héllo wörld ".repeat(10);
        let truncated = truncate_to_tokens(&text, cap);
        assert!(truncated.contains("output truncated"));
    }

    #[test]
    fn prefers_line_break_near_cut() {
        let cap = 5;
        let text = format!("{}\n{}", "a".repeat(15), "b".repeat(30));
        let truncated = truncate_to_tokens(&text, cap);
        assert!(truncated.starts_with(&"a".repeat(15)));
        assert!(!truncated.contains(&"b".repeat(10)));
    }
}
