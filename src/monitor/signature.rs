//! Error-signature normalization.
//!
//! Failure output is stripped of volatile detail (timestamps, absolute
//! paths, line and column numbers, memory addresses) and hashed so that the
//! same failure recurring across iterations maps to one signature.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Length of the hex prefix kept from the digest.
pub const SIGNATURE_LEN: usize = 16;

struct Patterns {
    timestamp: Regex,
    clock: Regex,
    path: Regex,
    line_col: Regex,
    line_word: Regex,
    hex_addr: Regex,
    space: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                timestamp: Regex::new(
                    r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
                )
                .ok()?,
                clock: Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").ok()?,
                path: Regex::new(r"(?:[A-Za-z]:)?(?:/[\w.\-@+]+){2,}/?").ok()?,
                line_col: Regex::new(r":\d+(?::\d+)?\b").ok()?,
                line_word: Regex::new(r"(?i)\bline \d+").ok()?,
                hex_addr: Regex::new(r"\b0x[0-9a-fA-F]+\b").ok()?,
                space: Regex::new(r"\s+").ok()?,
            })
        })
        .as_ref()
}

/// Strip volatile detail from failure text.
pub fn normalize(text: &str) -> String {
    let Some(p) = patterns() else {
        return text.split_whitespace().collect::<Vec<_>>().join(" ");
    };
    let text = p.timestamp.replace_all(text, "<ts>");
    let text = p.clock.replace_all(&text, "<ts>");
    let text = p.path.replace_all(&text, "<path>");
    let text = p.line_col.replace_all(&text, ":<n>");
    let text = p.line_word.replace_all(&text, "line <n>");
    let text = p.hex_addr.replace_all(&text, "<addr>");
    p.space.replace_all(text.trim(), " ").into_owned()
}

/// Stable signature of failure text.
pub fn signature(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(SIGNATURE_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_paths_and_lines() {
        let a = "error at /home/alice/proj/src/lib.rs:42:7: mismatched types";
        let b = "error at /tmp/build-99/src/lib.rs:97:1: mismatched types";
        assert_eq!(normalize(a), normalize(b));
        assert_eq!(signature(a), signature(b));
    }

    #[test]
    fn test_strips_timestamps_and_addresses() {
        let a = "2026-01-02T03:04:05Z panic at 0xdeadbeef in worker";
        let b = "2026-03-09 11:22:33.123 panic at 0x7fff0010 in worker";
        assert_eq!(signature(a), signature(b));
    }

    #[test]
    fn test_line_word_and_whitespace() {
        assert_eq!(
            normalize("SyntaxError on line 12\n\n   unexpected token"),
            "SyntaxError on line <n> unexpected token"
        );
    }

    #[test]
    fn test_distinct_failures_differ() {
        assert_ne!(
            signature("assertion failed: left == right"),
            signature("connection refused")
        );
        assert_eq!(signature("x").len(), SIGNATURE_LEN);
    }
}
