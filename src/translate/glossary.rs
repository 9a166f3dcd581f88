//! Heuristic detection of unusable cached word translations.
//! The phrase list is configuration: loaded from JSON, with built-in defaults.
//! Matching is a case-insensitive substring test and is inherently fuzzy.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Decides whether a cached translation may be shown.
pub trait Validator: Send + Sync {
    fn is_valid(&self, translation: &str) -> bool;
}

/// Built-in phrases typical of refusals, error boilerplate and echoed prompts.
pub const DEFAULT_PATTERNS: &[&str] = &[
    "please provide",
    "more context",
    "i cannot",
    "i can't",
    "i'm sorry",
    "i am sorry",
    "as an ai",
    "unable to translate",
    "cannot be translated",
    "translation not available",
    "no translation",
    "error:",
    "undefined",
];

pub const DEFAULT_MAX_CHARS: usize = 200;

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct ValidatorFile {
    #[serde(default = "default_max_chars")]
    max_chars: usize,
    patterns: Vec<String>,
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

#[derive(Debug, Clone)]
pub struct TranslationValidator {
    max_chars: usize,
    /// Lower-cased.
    patterns: Vec<String>,
}

#[derive(Debug)]
pub enum ValidatorError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ValidatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidatorError::Io(e) => write!(f, "validator patterns IO error: {e}"),
            ValidatorError::Parse(e) => write!(f, "validator patterns parse error: {e}"),
        }
    }
}

impl std::error::Error for ValidatorError {}

impl From<std::io::Error> for ValidatorError {
    fn from(e: std::io::Error) -> Self {
        ValidatorError::Io(e)
    }
}

impl From<serde_json::Error> for ValidatorError {
    fn from(e: serde_json::Error) -> Self {
        ValidatorError::Parse(e)
    }
}

impl TranslationValidator {
    pub fn new(max_chars: usize, patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            max_chars,
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Load the pattern list from a JSON file: `{"max_chars": 200, "patterns": [...]}`.
    pub fn load_from_file(path: &Path) -> Result<Self, ValidatorError> {
        let content = std::fs::read_to_string(path)?;
        let file: ValidatorFile = serde_json::from_str(&content)?;
        Ok(Self::new(file.max_chars, file.patterns))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for TranslationValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS, DEFAULT_PATTERNS)
    }
}

impl Validator for TranslationValidator {
    fn is_valid(&self, translation: &str) -> bool {
        let trimmed = translation.trim();
        if trimmed.is_empty() || trimmed.chars().count() > self.max_chars {
            return false;
        }
        let lower = trimmed.to_lowercase();
        !self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}
