//! Line normalization and word tokenization.
//! The normalized key is the only cache key for line translations, so it must
//! be deterministic and idempotent.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// A subtitle line as observed on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleLine {
    pub raw_text: String,
    pub normalized_key: String,
    pub start_time: Option<f64>,
}

impl SubtitleLine {
    pub fn new(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let normalized_key = normalized_key(&raw_text);
        Self {
            raw_text,
            normalized_key,
            start_time: None,
        }
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.normalized_key.is_empty()
    }
}

/// Lowercase, collapse newlines and runs of whitespace into single spaces, trim.
pub fn normalized_key(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lines that need no provider round-trip: a single character, or nothing alphabetic
/// (music notes, numbers, punctuation).
pub fn is_trivial(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.chars().count() <= 1 || !trimmed.chars().any(char::is_alphabetic)
}

/// Canonical form of a clicked word: lowercase with surrounding punctuation removed.
pub fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    Word,
    Separator,
}

/// One piece of a tokenized subtitle line. Word tokens are rendered clickable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
}

impl Token {
    fn word(text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind: TokenKind::Word,
        }
    }

    fn separator(text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind: TokenKind::Separator,
        }
    }

    pub fn is_word(&self) -> bool {
        self.kind == TokenKind::Word
    }
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Letters with inner apostrophes/hyphens: "don't", "well-known", "l'homme"
        Regex::new(r"\p{L}[\p{L}\p{M}]*(?:['’\-]\p{L}[\p{L}\p{M}]*)*")
            .expect("word pattern is a valid regex")
    })
}

/// Split a line into alternating word and separator tokens.
/// Concatenating the token texts reproduces the input exactly.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for m in word_pattern().find_iter(text) {
        if m.start() > last {
            tokens.push(Token::separator(&text[last..m.start()]));
        }
        tokens.push(Token::word(m.as_str()));
        last = m.end();
    }
    if last < text.len() {
        tokens.push(Token::separator(&text[last..]));
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_key_collapses_case_and_whitespace() {
        assert_eq!(normalized_key("  Hei\nMAAILMA \t again "), "hei maailma again");
        assert_eq!(normalized_key("hei maailma again"), "hei maailma again");
    }

    #[test]
    fn normalized_key_is_idempotent() {
        for raw in ["Hei maailma", "\n\n", "A  B\r\nC", "ÄITI  Sanoi\tNIIN"] {
            let once = normalized_key(raw);
            assert_eq!(normalized_key(&once), once);
        }
    }

    #[test]
    fn normalized_key_ignores_case_and_spacing_differences() {
        assert_eq!(normalized_key("Hello   World"), normalized_key("hello\nworld"));
    }

    #[test]
    fn trivial_lines_are_detected() {
        assert!(is_trivial("a"));
        assert!(is_trivial("  "));
        assert!(is_trivial("♪ ♪"));
        assert!(is_trivial("1234 !"));
        assert!(!is_trivial("ok"));
        assert!(!is_trivial("- Kiitos!"));
    }

    #[test]
    fn tokenize_alternates_and_reconstructs() {
        let line = "- Don't go, Anna!\nPlease.";
        let tokens = tokenize(line);
        let rebuilt: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(rebuilt, line);

        let words: Vec<&str> = tokens
            .iter()
            .filter(|t| t.is_word())
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(words, vec!["Don't", "go", "Anna", "Please"]);

        for pair in tokens.windows(2) {
            assert_ne!(pair[0].kind, pair[1].kind, "tokens must alternate");
        }
    }

    #[test]
    fn normalize_word_strips_punctuation() {
        assert_eq!(normalize_word("Talo,"), "talo");
        assert_eq!(normalize_word("«Koira»"), "koira");
    }
}
