//! Heuristic error detection in live terminal output
//!
//! Scans output chunks against a fixed set of failure signatures so
//! consumers can react to errors without re-scanning full history.

use once_cell::sync::Lazy;
use regex::Regex;

/// Trailing buffered lines included as context alongside the current chunk.
pub const CONTEXT_WINDOW: usize = 8;

/// Known failure signatures, checked in order.
static FAILURE_SIGNATURES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "command_not_found",
            r"command not found|not recognized as an internal or external command",
        ),
        ("permission_denied", r"Permission denied|EACCES|Operation not permitted"),
        ("rust_panic", r"thread '[^']*' panicked at"),
        ("python_traceback", r"^Traceback \(most recent call last\)"),
        ("js_stack_frame", r"^\s+at .+ \(.+:\d+:\d+\)$"),
        ("segfault", r"Segmentation fault"),
        ("missing_file", r"No such file or directory"),
        ("fatal", r"(?i)^(fatal|error):"),
    ]
    .iter()
    .map(|(name, pattern)| (*name, Regex::new(pattern).unwrap()))
    .collect()
});

/// A failure signature match with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedError {
    /// Name of the matched signature.
    pub signature: String,
    /// The line that matched.
    pub line: String,
    /// Trailing buffered lines plus the current chunk's lines.
    pub context: Vec<String>,
}

/// Stateless output scanner.
///
/// Only lines of the current chunk are eligible to match; the recent buffer
/// is included as context only. That way a buffered error line is reported
/// once, not again on every subsequent chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorDetector;

impl ErrorDetector {
    pub fn new() -> Self {
        Self
    }

    /// Scan a chunk against the failure signatures.
    ///
    /// `recent` is the trailing portion of the session's line buffer; at
    /// most [`CONTEXT_WINDOW`] of its lines are carried into the context.
    pub fn scan(&self, chunk: &str, recent: &[String]) -> Option<DetectedError> {
        for line in chunk.lines() {
            for (name, pattern) in FAILURE_SIGNATURES.iter() {
                if pattern.is_match(line) {
                    let start = recent.len().saturating_sub(CONTEXT_WINDOW);
                    let mut context: Vec<String> = recent[start..].to_vec();
                    context.extend(chunk.lines().map(str::to_string));
                    return Some(DetectedError {
                        signature: name.to_string(),
                        line: line.to_string(),
                        context,
                    });
                }
            }
        }
        None
    }
}
