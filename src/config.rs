//! Settings: the synchronized key-value store the settings screens write to.
//! Loaded from a JSON file, overridden by `DUALSUB_*` environment variables,
//! and published on a watch channel so the core can react to changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::observer::DEFAULT_SUBTITLE_MARKER;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub target_language: String,
    /// Provider name; only chat-completions providers are built in.
    pub translation_provider: String,
    pub provider_api_key: String,
    pub provider_base_url: Option<String>,
    pub provider_model: Option<String>,
    pub dual_sub_enabled: bool,
    pub auto_pause_enabled: bool,
    pub playback_speed: f64,
    pub cache_max_age_days: u32,
    /// Class carried by the page's subtitle container.
    pub subtitle_marker: String,
    pub database_path: Option<PathBuf>,
    /// JSON file overriding the invalid-translation phrase list.
    pub invalid_patterns_path: Option<PathBuf>,
    pub dictionary_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_language: "EN-US".to_string(),
            translation_provider: "deepseek".to_string(),
            provider_api_key: String::new(),
            provider_base_url: None,
            provider_model: None,
            dual_sub_enabled: true,
            auto_pause_enabled: false,
            playback_speed: 1.0,
            cache_max_age_days: 30,
            subtitle_marker: DEFAULT_SUBTITLE_MARKER.to_string(),
            database_path: None,
            invalid_patterns_path: None,
            dictionary_base_url: "https://en.wiktionary.org/api/rest_v1".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "settings IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "settings parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// File (if given and readable) then environment; never fails.
    pub fn load(path: Option<&Path>) -> Self {
        let base = match path {
            Some(p) => Self::load_from_file(p).unwrap_or_else(|e| {
                warn!(error = %e, path = %p.display(), "settings load failed, using defaults");
                Self::default()
            }),
            None => Self::default(),
        };
        base.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `DUALSUB_*` overrides read through `lookup`.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("DUALSUB_TARGET_LANGUAGE") {
            self.target_language = v;
        }
        if let Some(v) = lookup("DUALSUB_PROVIDER") {
            self.translation_provider = v;
        }
        if let Some(v) = lookup("DUALSUB_API_KEY").or_else(|| lookup("DEEPSEEK_API_KEY")) {
            self.provider_api_key = v;
        }
        if let Some(v) = lookup("DUALSUB_BASE_URL") {
            self.provider_base_url = Some(v);
        }
        if let Some(v) = lookup("DUALSUB_DB_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DUALSUB_CACHE_MAX_AGE_DAYS") {
            match v.parse() {
                Ok(days) => self.cache_max_age_days = days,
                Err(_) => warn!(value = %v, "ignoring non-numeric DUALSUB_CACHE_MAX_AGE_DAYS"),
            }
        }
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.provider_api_key.trim().is_empty()
    }
}

/// Current settings plus change notifications.
pub struct SettingsStore {
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings);
        Self { tx }
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Mutate and notify subscribers when something actually changed.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> bool {
        let changed = self.tx.send_if_modified(|settings| {
            let before = settings.clone();
            f(settings);
            *settings != before
        });
        if changed {
            info!("settings changed");
        }
        changed
    }
}
