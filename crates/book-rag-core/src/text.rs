//! Text helpers shared by packing, validation, and ingestion.
//!
//! Token counts are estimated at 4 characters per token. Every budget in
//! the pipeline (context packing, selection truncation) goes through
//! [`estimate_tokens`] so they agree with each other.
//!
//! ```rust
//! use book_rag_core::text::{estimate_tokens, truncate_to_tokens};
//!
//! assert_eq!(estimate_tokens("abcdefgh"), 2);
//! let (cut, truncated) = truncate_to_tokens("alpha beta gamma delta", 3);
//! assert_eq!(cut, "alpha beta");
//! assert!(truncated);
//! ```

use sha2::{Digest, Sha256};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Cut `text` so it fits in `max_tokens`, preferring a whitespace boundary.
///
/// Returns the (possibly unchanged) prefix and whether anything was cut.
/// Deterministic: the same input always yields the same prefix. Falls back
/// to a hard cut on a char boundary when the budget holds no whitespace.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> (&str, bool) {
    let max_bytes = max_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_bytes {
        return (text, false);
    }
    let hard = snap_to_char_boundary(text, max_bytes);
    // A cut that lands exactly before whitespace keeps the whole last word.
    let at_word_end = text[hard..].starts_with(char::is_whitespace);
    let cut = if at_word_end {
        hard
    } else {
        text[..hard]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(hard)
    };
    (text[..cut].trim_end(), true)
}

/// First `max_chars` characters of `text`, with `...` when shortened.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// SHA-256 hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
