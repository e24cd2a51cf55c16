//! Captured-mode output rewriting
//!
//! Short commands run on the caller's behalf have their usage text reworded so
//! it names the multiplexer. Lines carrying paths, URLs or environment
//! variable names are left alone, since rewriting those would break them.

use regex_lite::Regex;
use std::sync::OnceLock;

/// Substrings marking a line that must pass through verbatim
const SAFE_MARKERS: &[&str] = &["OLLAMA_", "ollama/", "http", ".com", "docker", "/usr"];

const REPLACEMENT: &str = "ollamamux";

fn product_name() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\bollama\b").ok()).as_ref()
}

/// Rewrite one line of backend output. Returns the input unchanged when
/// nothing matched.
pub fn rewrite_line(line: &str) -> String {
    if SAFE_MARKERS.iter().any(|marker| line.contains(marker)) {
        return line.to_string();
    }
    match product_name() {
        Some(pattern) => pattern.replace_all(line, REPLACEMENT).into_owned(),
        None => line.to_string(),
    }
}

/// Rewrite a raw chunk ending at (and possibly including) a newline.
///
/// Invalid UTF-8 is replaced lossily; line terminators are kept as they were.
pub fn rewrite_chunk(chunk: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(chunk);
    let (body, terminator) = split_terminator(&text);
    let mut out = rewrite_line(body).into_bytes();
    out.extend_from_slice(terminator.as_bytes());
    out
}

fn split_terminator(text: &str) -> (&str, &str) {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    text.split_at(trimmed.len())
}
