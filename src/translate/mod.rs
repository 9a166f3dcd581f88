//! Translation module: messaging contract with the privileged background
//! service, tagged replies, and the line/word translation pipeline.

pub mod batch;
pub mod cache;
pub mod deepseek;
pub mod dictionary;
pub mod glossary;
pub mod normalize;
pub mod queue;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reply from the background service. `ContextInvalidated` is the sentinel for a
/// host context that went away (extension reloaded, tab detached); callers treat
/// it as a soft failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Ok(T),
    Failed(String),
    ContextInvalidated,
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Reply::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<T, TranslateError> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Failed(msg) => Err(TranslateError::ApiError(msg)),
            Reply::ContextInvalidated => Err(TranslateError::ContextInvalidated),
        }
    }
}

impl<T> From<Result<T, TranslateError>> for Reply<T> {
    fn from(result: Result<T, TranslateError>) -> Self {
        match result {
            Ok(v) => Reply::Ok(v),
            Err(TranslateError::ContextInvalidated) => Reply::ContextInvalidated,
            Err(e) => Reply::Failed(e.to_string()),
        }
    }
}

/// Where a word translation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordSource {
    Cache,
    Dictionary,
    Ai,
}

impl WordSource {
    pub fn as_str(self) -> &'static str {
        match self {
            WordSource::Cache => "cache",
            WordSource::Dictionary => "dictionary",
            WordSource::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cache" => Some(WordSource::Cache),
            "dictionary" => Some(WordSource::Dictionary),
            "ai" => Some(WordSource::Ai),
            _ => None,
        }
    }
}

impl std::fmt::Display for WordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A translated word, keyed by (word, target_language).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTranslation {
    pub word: String,
    pub target_language: String,
    pub translation: String,
    pub source: WordSource,
}

impl WordTranslation {
    /// Tier-1 key, e.g. `talo:EN-US`.
    pub fn cache_key(word: &str, target_language: &str) -> String {
        format!("{word}:{target_language}")
    }
}

/// The privileged background service. Every action replies with a [`Reply`].
#[async_trait]
pub trait Background: Send + Sync {
    /// Whether the host runtime context is still alive.
    fn is_context_valid(&self) -> bool {
        true
    }

    async fn fetch_translation(&self, lines: &[String], target_language: &str) -> Reply<Vec<String>>;

    async fn fetch_batch_translation(
        &self,
        lines: &[String],
        target_language: &str,
        is_contextual: bool,
    ) -> Reply<Vec<String>>;

    async fn translate_word_with_context(
        &self,
        word: &str,
        context_text: &str,
        target_language: &str,
        lang_name: &str,
    ) -> Reply<String>;

    async fn clear_word_cache(&self) -> Reply<()>;

    async fn open_options_page(&self) -> Reply<()>;
}

/// Wraps the background service so that every call first checks host-context
/// validity; an invalidated context is a logged no-op returning the sentinel.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<dyn Background>,
}

impl Messenger {
    pub fn new(inner: Arc<dyn Background>) -> Self {
        Self { inner }
    }

    fn context_ok(&self, action: &'static str) -> bool {
        if self.inner.is_context_valid() {
            return true;
        }
        warn!(action, "host context invalidated, skipping background call");
        false
    }

    pub async fn fetch_translation(&self, lines: &[String], target_language: &str) -> Reply<Vec<String>> {
        if !self.context_ok("fetchTranslation") {
            return Reply::ContextInvalidated;
        }
        debug!(count = lines.len(), target_language, "fetchTranslation");
        self.inner.fetch_translation(lines, target_language).await
    }

    pub async fn fetch_batch_translation(
        &self,
        lines: &[String],
        target_language: &str,
        is_contextual: bool,
    ) -> Reply<Vec<String>> {
        if !self.context_ok("fetchBatchTranslation") {
            return Reply::ContextInvalidated;
        }
        debug!(count = lines.len(), target_language, is_contextual, "fetchBatchTranslation");
        self.inner
            .fetch_batch_translation(lines, target_language, is_contextual)
            .await
    }

    pub async fn translate_word_with_context(
        &self,
        word: &str,
        context_text: &str,
        target_language: &str,
        lang_name: &str,
    ) -> Reply<String> {
        if !self.context_ok("translateWordWithContext") {
            return Reply::ContextInvalidated;
        }
        self.inner
            .translate_word_with_context(word, context_text, target_language, lang_name)
            .await
    }

    pub async fn clear_word_cache(&self) -> Reply<()> {
        if !self.context_ok("clearWordCache") {
            return Reply::ContextInvalidated;
        }
        self.inner.clear_word_cache().await
    }

    pub async fn open_options_page(&self) -> Reply<()> {
        if !self.context_ok("openOptionsPage") {
            return Reply::ContextInvalidated;
        }
        self.inner.open_options_page().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranslateError {
    ApiError(String),
    RateLimited { retry_after_ms: u64 },
    Timeout,
    ContextInvalidated,
    InvalidInput(String),
    Parse(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::ApiError(msg) => write!(f, "API error: {msg}"),
            TranslateError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {retry_after_ms}ms")
            }
            TranslateError::Timeout => write!(f, "translation timeout"),
            TranslateError::ContextInvalidated => write!(f, "host context invalidated"),
            TranslateError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            TranslateError::Parse(msg) => write!(f, "unparseable response: {msg}"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Human-readable language name for prompts, from a code such as `EN-US` or `fi`.
pub fn language_name(code: &str) -> &'static str {
    let base = code
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match base.as_str() {
        "en" => "English",
        "fi" => "Finnish",
        "sv" => "Swedish",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "pl" => "Polish",
        "ru" => "Russian",
        "uk" => "Ukrainian",
        "tr" => "Turkish",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "vi" => "Vietnamese",
        "th" => "Thai",
        _ => "the target language",
    }
}
