//! Chat-completions background service.
//! Pooled reqwest client, a next-allowed-instant rate limiter, and retry on
//! 429/5xx/timeout. Lines go out as a JSON array and come back as one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Background, Reply, TranslateError};
use crate::config::Settings;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";

pub struct HttpBackground {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    /// Minimum spacing between requests.
    min_interval: Duration,
    /// Cancelled when the host context goes away.
    shutdown: CancellationToken,
}

impl HttpBackground {
    /// A missing API key is not an error here; requests fail until one is set.
    pub fn from_settings(settings: &Settings) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_key: settings.provider_api_key.clone(),
            base_url: settings
                .provider_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            model: settings
                .provider_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(100),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token whose cancellation invalidates this context.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    async fn complete(&self, system: &str, user: String, max_tokens: u32) -> Result<String, TranslateError> {
        if self.api_key.trim().is_empty() {
            return Err(TranslateError::InvalidInput("no provider API key configured".into()));
        }
        self.rate_limit_wait().await;
        if self.shutdown.is_cancelled() {
            return Err(TranslateError::ContextInvalidated);
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "max_tokens": max_tokens,
            "stream": false,
            "temperature": 0.1
        });

        let start = Instant::now();
        let response = self.send_with_retry(&body).await?;
        let parsed: Completion = response
            .json()
            .await
            .map_err(|e| TranslateError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TranslateError::Parse("completion without content".into()))?;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or_default(),
            "completion received"
        );
        Ok(content)
    }

    async fn translate_lines(
        &self,
        lines: &[String],
        target_language: &str,
        is_contextual: bool,
    ) -> Result<Vec<String>, TranslateError> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        let system = if is_contextual { CONTEXTUAL_PROMPT } else { LINES_PROMPT };
        let user = build_lines_prompt(lines, target_language)?;
        let content = self.complete(system, user, estimate_max_tokens(lines)).await?;
        parse_lines_reply(&content, lines.len())
    }

    /// 429: Retry-After or 1s/2s/4s (max 3). 5xx: backoff (max 2).
    /// Timeout: one immediate retry.
    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<reqwest::Response, TranslateError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(TranslateError::RateLimited { retry_after_ms: 0 });
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    self.backoff(wait).await?;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(TranslateError::ApiError(format!("server error: {}", resp.status())));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    self.backoff(wait).await?;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(TranslateError::ApiError(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(TranslateError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(TranslateError::ApiError(e.to_string())),
            }
        }
    }

    async fn backoff(&self, wait: Duration) -> Result<(), TranslateError> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = self.shutdown.cancelled() => Err(TranslateError::ContextInvalidated),
        }
    }
}

#[async_trait]
impl Background for HttpBackground {
    fn is_context_valid(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn fetch_translation(&self, lines: &[String], target_language: &str) -> Reply<Vec<String>> {
        self.translate_lines(lines, target_language, false).await.into()
    }

    async fn fetch_batch_translation(
        &self,
        lines: &[String],
        target_language: &str,
        is_contextual: bool,
    ) -> Reply<Vec<String>> {
        self.translate_lines(lines, target_language, is_contextual).await.into()
    }

    async fn translate_word_with_context(
        &self,
        word: &str,
        context_text: &str,
        _target_language: &str,
        lang_name: &str,
    ) -> Reply<String> {
        let user = build_word_prompt(word, context_text, lang_name);
        let result = self
            .complete(WORD_PROMPT, user, 64)
            .await
            .map(|content| clean_word_reply(&content));
        match result {
            Ok(text) if text.is_empty() => Reply::Failed("empty word translation".into()),
            other => other.into(),
        }
    }

    async fn clear_word_cache(&self) -> Reply<()> {
        // Word entries live in the shared store; nothing is held service-side.
        info!("word cache clear acknowledged");
        Reply::Ok(())
    }

    async fn open_options_page(&self) -> Reply<()> {
        info!("settings required: configure a provider API key");
        Reply::Ok(())
    }
}

// --- Prompt construction ---

const LINES_PROMPT: &str = "You translate subtitles. The user sends a JSON object with a target \
language and an array of lines. Reply with only a JSON array of translated strings, one per \
input line, in the same order.";

const CONTEXTUAL_PROMPT: &str = "You translate consecutive subtitle lines from one film. Use \
the surrounding lines as context for names, tone and pronouns. The user sends a JSON object with \
a target language and an array of lines. Reply with only a JSON array of translated strings, \
one per input line, in the same order.";

const WORD_PROMPT: &str = "You are a bilingual dictionary. Give the meaning of the word as used \
in the given subtitle context. Reply with the translation only, at most a few words.";

fn build_lines_prompt(lines: &[String], target_language: &str) -> Result<String, TranslateError> {
    serde_json::to_string(&serde_json::json!({ "l": target_language, "lines": lines }))
        .map_err(|e| TranslateError::InvalidInput(e.to_string()))
}

fn build_word_prompt(word: &str, context_text: &str, lang_name: &str) -> String {
    format!("Word: {word}\nContext:\n{context_text}\nTranslate the word into {lang_name}.")
}

/// Roughly three bytes per token plus headroom per line.
fn estimate_max_tokens(lines: &[String]) -> u32 {
    let bytes: usize = lines.iter().map(String::len).sum();
    let max = (bytes as f64 / 3.0 * 1.3) as u32 + 16 * lines.len() as u32 + 32;
    max.clamp(64, 2048)
}

/// Accepts a bare JSON array or one wrapped in prose/code fences; falls back to
/// one translation per non-empty line when the model ignored the format.
fn parse_lines_reply(content: &str, expected: usize) -> Result<Vec<String>, TranslateError> {
    if let (Some(open), Some(close)) = (content.find('['), content.rfind(']')) {
        if open < close {
            if let Ok(parsed) = serde_json::from_str::<Vec<String>>(&content[open..=close]) {
                return Ok(parsed);
            }
        }
    }
    let fallback: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .map(str::to_string)
        .collect();
    if fallback.len() == expected {
        return Ok(fallback);
    }
    Err(TranslateError::Parse(format!(
        "expected {expected} lines, got unparseable reply of {} bytes",
        content.len()
    )))
}

fn clean_word_reply(content: &str) -> String {
    content
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .trim()
        .to_string()
}

// --- Response types ---

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_array() {
        let reply = "```json\n[\"Hello world\", \"Goodbye\"]\n```";
        assert_eq!(
            parse_lines_reply(reply, 2).unwrap(),
            vec!["Hello world".to_string(), "Goodbye".to_string()]
        );
    }

    #[test]
    fn falls_back_to_plain_lines_when_counts_match() {
        assert_eq!(parse_lines_reply("One\n\nTwo\n", 2).unwrap(), vec!["One", "Two"]);
        assert!(matches!(parse_lines_reply("One", 2), Err(TranslateError::Parse(_))));
    }

    #[test]
    fn lines_prompt_is_escaped_json() {
        let prompt = build_lines_prompt(&["say \"hei\"".into()], "EN-US").unwrap();
        let value: serde_json::Value = serde_json::from_str(&prompt).unwrap();
        assert_eq!(value["l"], "EN-US");
        assert_eq!(value["lines"][0], "say \"hei\"");
    }

    #[test]
    fn word_reply_is_trimmed_to_first_line() {
        assert_eq!(clean_word_reply("\"house\".\nIt means a building."), "house");
    }

    #[test]
    fn token_estimate_is_bounded() {
        assert_eq!(estimate_max_tokens(&["hi".into()]), 64);
        assert_eq!(estimate_max_tokens(&["x".repeat(50_000)]), 2048);
    }

    #[tokio::test]
    async fn missing_key_fails_requests_without_network() {
        let background = HttpBackground::from_settings(&Settings::default()).unwrap();
        let reply = background.fetch_translation(&["hei".into()], "EN-US").await;
        assert_eq!(
            reply,
            Reply::Failed("invalid input: no provider API key configured".into())
        );
    }

    #[test]
    fn shutdown_invalidates_context() {
        let background = HttpBackground::from_settings(&Settings::default()).unwrap();
        assert!(background.is_context_valid());
        background.shutdown_token().cancel();
        assert!(!background.is_context_valid());
    }
}
