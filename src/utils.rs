//! Small string helpers shared by the composer, the ledger and the transport.

use sha2::{Digest, Sha256};

/// Keep the first `max_chars` characters of `s`, appending "..." when anything was cut.
///
/// Counts characters, not bytes, so Cyrillic text and emoji are never split.
///
/// ```ignore
/// assert_eq!(truncate_str("привет мир", 6), "привет...");
/// assert_eq!(truncate_str("short", 10), "short");
/// ```
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let mut chars = s.char_indices();
    match chars.nth(max_chars) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}...", &s[..cut]),
    }
}

/// Escape text content for Telegram HTML. Only `<`, `>` and `&` are special there.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// First `len` hex characters of the SHA-256 of `input`.
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

/// Collapse runs of whitespace (including newlines) into single spaces.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
