//! Free dictionary lookup over the Wiktionary REST definition endpoint.
//! English Wiktionary glosses foreign words in English, so only English
//! targets are served; anything else reports "not found" and the lookup
//! chain moves on to the model.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::TranslateError;
use crate::lookup::Dictionary;

pub struct HttpDictionary {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDictionary {
    pub fn new(base_url: &str) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("dualsub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Dictionary for HttpDictionary {
    async fn lookup(&self, word: &str, target_language: &str) -> Result<Option<String>, TranslateError> {
        if !target_language.to_ascii_lowercase().starts_with("en") {
            return Ok(None);
        }
        let url = format!("{}/page/definition/{}", self.base_url, word);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TranslateError::Timeout
            } else {
                TranslateError::ApiError(e.to_string())
            }
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(word, "not in dictionary");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(TranslateError::ApiError(format!("dictionary status {}", resp.status())));
        }

        match resp.json::<DefinitionPage>().await {
            Ok(page) => Ok(first_gloss(&page)),
            Err(e) => {
                debug!(word, error = %e, "dictionary payload unreadable, treating as not found");
                Ok(None)
            }
        }
    }
}

/// Entries keyed by language code of the headword.
type DefinitionPage = HashMap<String, Vec<Usage>>;

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    definitions: Vec<Definition>,
}

#[derive(Deserialize)]
struct Definition {
    definition: String,
}

fn first_gloss(page: &DefinitionPage) -> Option<String> {
    // Deterministic order: prefer non-English headwords (the foreign word itself).
    let mut langs: Vec<&String> = page.keys().collect();
    langs.sort_by(|a, b| (*a == "en", a).cmp(&(*b == "en", b)));
    langs
        .into_iter()
        .flat_map(|l| page[l].iter())
        .flat_map(|u| u.definitions.iter())
        .map(|d| strip_html(&d.definition))
        .find(|g| !g.is_empty())
}

fn strip_html(html: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is a valid regex"));
    let text = tag.replace_all(html, "");
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
