//! Dangerous-command detection.
//!
//! The scan is part of the gate, not of any tool: every string argument of a
//! call is checked against patterns for destructive shell usage. Command
//! strings are split into segments at unquoted separators so a safe prefix
//! cannot smuggle a dangerous suffix, and leading `VAR=value` assignments are
//! discarded before the command word is classified.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FORK_BOMB_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:").unwrap());
static NETWORK_PIPE_TO_SHELL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(curl|wget)\b.*\|\s*(sh|bash|zsh)\b").unwrap());
static DANGEROUS_REDIRECT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)>\s*/dev/(sd|nvme|vd|xvd|disk)").unwrap());
static SYS_PROC_WRITE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)>\s*/(sys|proc)/").unwrap());

/// System trees an `rm -rf` must never target.
const PROTECTED_ROOTS: &[&str] = &["/etc", "/usr", "/var", "/boot", "/bin", "/sbin", "/lib"];

/// Split a command line at unquoted `;`, `|`, and `&`. Doubled separators
/// (`&&`, `||`) fall out naturally: the second character flushes an empty
/// segment, which is discarded.
fn command_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    let flush = |current: &mut String, segments: &mut Vec<String>| {
        let segment = current.trim();
        if !segment.is_empty() {
            segments.push(segment.to_string());
        }
        current.clear();
    };

    for ch in command.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match (ch, quote) {
            // Inside single quotes a backslash is literal.
            ('\\', Some('\'')) => current.push(ch),
            ('\\', _) => {
                current.push(ch);
                escaped = true;
            }
            ('\'' | '"', None) => {
                quote = Some(ch);
                current.push(ch);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(ch);
            }
            (';' | '|' | '&', None) => flush(&mut current, &mut segments),
            _ => current.push(ch),
        }
    }

    flush(&mut current, &mut segments);
    segments
}

/// Tokens of one segment with any leading `VAR=value` assignments dropped,
/// so `DEBUG=1 rm ...` classifies as `rm`.
fn effective_tokens(segment: &str) -> Vec<String> {
    let tokens = shell_words::split(segment).unwrap_or_else(|_| {
        segment
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    });

    let assignments = tokens
        .iter()
        .take_while(|t| looks_like_assignment(t))
        .count();
    tokens[assignments..].to_vec()
}

fn looks_like_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) if !name.is_empty() => name
            .chars()
            .all(|c| c == '_' || c.is_ascii_alphanumeric()),
        _ => false,
    }
}

/// `rm` with both recursive and force flags aimed at a protected target.
fn rm_hits_protected_target(tokens: &[String]) -> bool {
    let mut recursive = false;
    let mut force = false;
    for flag in tokens.iter().skip(1).filter(|t| t.starts_with('-')) {
        recursive |= flag.contains('r') || flag.contains('R');
        force |= flag.contains('f');
    }
    if !recursive || !force {
        return false;
    }

    tokens
        .iter()
        .skip(1)
        .filter(|t| !t.starts_with('-'))
        .any(|target| is_protected_target(target))
}

fn is_protected_target(target: &str) -> bool {
    if matches!(
        target,
        "/" | "/*" | "~" | "~/" | "$HOME" | "$HOME/" | "${HOME}" | "${HOME}/"
    ) {
        return true;
    }
    PROTECTED_ROOTS
        .iter()
        .any(|root| target == *root || target.starts_with(&format!("{}/", root)))
}

fn dd_touches_device(tokens: &[String]) -> bool {
    tokens.iter().skip(1).any(|t| {
        t.strip_prefix("if=")
            .or_else(|| t.strip_prefix("of="))
            .is_some_and(|path| path.starts_with("/dev/"))
    })
}

fn segment_reason(segment: &str) -> Option<&'static str> {
    if FORK_BOMB_PATTERN.is_match(segment) {
        return Some("fork bomb");
    }
    if NETWORK_PIPE_TO_SHELL_PATTERN.is_match(segment) {
        return Some("network script piped to shell");
    }
    if DANGEROUS_REDIRECT_PATTERN.is_match(segment) {
        return Some("raw disk redirection");
    }
    if SYS_PROC_WRITE_PATTERN.is_match(segment) {
        return Some("kernel interface write");
    }

    let tokens = effective_tokens(segment);
    let command = tokens.first()?.to_ascii_lowercase();

    match command.as_str() {
        "sudo" | "doas" | "su" => return Some("privilege escalation"),
        "rm" if rm_hits_protected_target(&tokens) => return Some("destructive rm target"),
        "dd" if dd_touches_device(&tokens) => return Some("direct disk access with dd"),
        _ => {}
    }

    if command.starts_with("mkfs") {
        return Some("filesystem formatting command");
    }

    if command == "chmod" {
        let world_writable = tokens
            .iter()
            .skip(1)
            .any(|t| matches!(t.as_str(), "777" | "0777" | "-R"));
        let on_root = tokens.iter().skip(1).any(|t| t == "/" || t == "/*");
        if world_writable && on_root {
            return Some("recursive permission change on root");
        }
    }

    None
}

/// Scan one command string. Returns the reason it is dangerous, if any.
pub fn dangerous_command_reason(command: &str) -> Option<&'static str> {
    // Pipes are segment boundaries below, so patterns that span them run
    // against the whole line first.
    if FORK_BOMB_PATTERN.is_match(command) {
        return Some("fork bomb");
    }
    if NETWORK_PIPE_TO_SHELL_PATTERN.is_match(command) {
        return Some("network script piped to shell");
    }

    command_segments(command)
        .iter()
        .find_map(|segment| segment_reason(segment))
}

/// Scan every string leaf of a tool-call argument object.
pub fn scan_arguments(args: &Value) -> Option<&'static str> {
    match args {
        Value::String(s) => dangerous_command_reason(s),
        Value::Array(items) => items.iter().find_map(scan_arguments),
        Value::Object(map) => map.values().find_map(scan_arguments),
        _ => None,
    }
}
