//! Popup dictionary.
//! A click on a word token opens a tooltip and resolves the word through
//! tier-1 word cache → tier-2 word cache (validated, bad entries purged) →
//! dictionary → AI with surrounding subtitle lines as context.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancellation::TaskGeneration;
use crate::history::RecentLines;
use crate::state_machine::{TooltipMachine, TooltipState, TooltipStatus, WordAnchor};
use crate::translate::glossary::Validator;
use crate::translate::normalize::normalize_word;
use crate::translate::store::SubtitleStore;
use crate::translate::{language_name, Messenger, Reply, TranslateError, WordSource, WordTranslation};

pub const WORD_CACHE_CAPACITY: usize = 2048;
/// Space between the anchor word and the tooltip.
pub const TOOLTIP_GAP: f64 = 8.0;
/// Minimum distance between the tooltip and the viewport edges.
pub const VIEWPORT_MARGIN: f64 = 8.0;

/// External dictionary keyed by the bare word.
#[async_trait]
pub trait Dictionary: Send + Sync {
    /// `Ok(None)` when the word is unknown.
    async fn lookup(&self, word: &str, target_language: &str) -> Result<Option<String>, TranslateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Placement {
    pub left: f64,
    pub top: f64,
    pub below: bool,
}

/// Centered above the anchor; below it when the viewport top is too close;
/// horizontally clamped inside the viewport margins.
pub fn position_tooltip(anchor: Rect, tooltip: Size, viewport: Size) -> Placement {
    let centered = anchor.x + anchor.width / 2.0 - tooltip.width / 2.0;
    let max_left = (viewport.width - VIEWPORT_MARGIN - tooltip.width).max(VIEWPORT_MARGIN);
    let left = centered.clamp(VIEWPORT_MARGIN, max_left);

    let above = anchor.y - TOOLTIP_GAP - tooltip.height;
    if above >= VIEWPORT_MARGIN {
        Placement {
            left,
            top: above,
            below: false,
        }
    } else {
        Placement {
            left,
            top: anchor.y + anchor.height + TOOLTIP_GAP,
            below: true,
        }
    }
}

/// Keys that move playback or focus and therefore dismiss the tooltip.
pub fn is_navigation_key(key: &str) -> bool {
    matches!(
        key,
        "Escape" | "ArrowLeft" | "ArrowRight" | "ArrowUp" | "ArrowDown" | "PageUp" | "PageDown" | "Home" | "End"
    )
}

/// A click on a word token.
#[derive(Debug, Clone, PartialEq)]
pub struct WordClick {
    pub word: String,
    pub anchor: WordAnchor,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// Re-click on the open tooltip's word.
    Closed,
    Resolved(WordSource),
    Failed(String),
    /// Superseded by a newer click or closed while in flight.
    Stale,
    /// Action not available in the current tooltip state.
    Ignored,
}

pub struct WordLookupService {
    tier1: Mutex<LruCache<String, WordTranslation>>,
    store: Option<Arc<SubtitleStore>>,
    dictionary: Arc<dyn Dictionary>,
    messenger: Messenger,
    validator: Arc<dyn Validator>,
    tooltip: TooltipMachine,
    recent: Arc<Mutex<RecentLines>>,
    generations: TaskGeneration,
    target_language: RwLock<String>,
}

impl WordLookupService {
    pub fn new(
        store: Option<Arc<SubtitleStore>>,
        dictionary: Arc<dyn Dictionary>,
        messenger: Messenger,
        validator: Arc<dyn Validator>,
        recent: Arc<Mutex<RecentLines>>,
        target_language: &str,
    ) -> Self {
        let capacity = NonZeroUsize::new(WORD_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            tier1: Mutex::new(LruCache::new(capacity)),
            store,
            dictionary,
            messenger,
            validator,
            tooltip: TooltipMachine::new(),
            recent,
            generations: TaskGeneration::new(),
            target_language: RwLock::new(target_language.to_string()),
        }
    }

    pub fn tooltip(&self) -> &TooltipMachine {
        &self.tooltip
    }

    pub fn current(&self) -> Option<TooltipState> {
        self.tooltip.current()
    }

    pub fn set_target_language(&self, target_language: &str) {
        *self.target_language.write() = target_language.to_string();
        self.close();
    }

    fn target_language(&self) -> String {
        self.target_language.read().clone()
    }

    /// Toggle on re-click, otherwise replace any open tooltip and look the word up.
    pub async fn on_word_click(&self, click: WordClick) -> LookupOutcome {
        if self.tooltip.is_open_at(&click.anchor) {
            self.close();
            return LookupOutcome::Closed;
        }
        let word = normalize_word(&click.word);
        if word.is_empty() {
            return LookupOutcome::Ignored;
        }
        self.tooltip.close();
        self.tooltip.open(&word, click.anchor, &click.line);
        self.run_chain(&word, &click.line).await
    }

    /// "Ask AI": re-query with context and overwrite the cached entry.
    pub async fn ask_ai(&self) -> LookupOutcome {
        let Some(state) = self.tooltip.current() else {
            return LookupOutcome::Ignored;
        };
        if state.status != TooltipStatus::Resolved || state.source == Some(WordSource::Ai) {
            return LookupOutcome::Ignored;
        }
        if self.tooltip.reload().is_err() {
            return LookupOutcome::Ignored;
        }
        let guard = self.generations.advance();
        let language = self.target_language();
        let result = self.ask_model(&state.word, &state.line, &language).await;
        if !guard.should_continue() {
            return LookupOutcome::Stale;
        }
        match result {
            Ok(translation) => {
                self.remember(&state.word, &language, &translation, WordSource::Ai);
                self.settle(Ok((translation, WordSource::Ai)))
            }
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Manual retry from the error state.
    pub async fn retry(&self) -> LookupOutcome {
        let Some(state) = self.tooltip.current() else {
            return LookupOutcome::Ignored;
        };
        if state.status != TooltipStatus::Error || self.tooltip.reload().is_err() {
            return LookupOutcome::Ignored;
        }
        self.run_chain(&state.word, &state.line).await
    }

    pub fn close(&self) {
        self.generations.cancel_all();
        self.tooltip.close();
    }

    pub fn on_outside_click(&self) {
        self.close();
    }

    /// Returns whether the key closed the tooltip.
    pub fn on_key(&self, key: &str) -> bool {
        if self.tooltip.status() == TooltipStatus::Idle || !is_navigation_key(key) {
            return false;
        }
        self.close();
        true
    }

    /// Drop every cached word translation, in both tiers and in the background.
    pub async fn clear_word_cache(&self) {
        self.tier1.lock().clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_all_word_translations() {
                warn!(error = %e, "failed to clear persisted word translations");
            }
        }
        if let Reply::Failed(e) = self.messenger.clear_word_cache().await {
            warn!(error = %e, "background word cache clear failed");
        }
    }

    async fn run_chain(&self, word: &str, line: &str) -> LookupOutcome {
        let guard = self.generations.advance();
        let result = self.resolve(word, line).await;
        if !guard.should_continue() {
            debug!(word, "word lookup finished after tooltip changed, discarding");
            return LookupOutcome::Stale;
        }
        self.settle(result)
    }

    fn settle(&self, result: Result<(String, WordSource), String>) -> LookupOutcome {
        match result {
            Ok((translation, source)) => match self.tooltip.resolve(&translation, source) {
                Ok(_) => LookupOutcome::Resolved(source),
                Err(_) => LookupOutcome::Stale,
            },
            Err(error) => match self.tooltip.fail(&error) {
                Ok(_) => LookupOutcome::Failed(error),
                Err(_) => LookupOutcome::Stale,
            },
        }
    }

    async fn resolve(&self, word: &str, line: &str) -> Result<(String, WordSource), String> {
        let language = self.target_language();
        if let Some(hit) = self.cached(word, &language) {
            return Ok((hit, WordSource::Cache));
        }

        match self.dictionary.lookup(word, &language).await {
            Ok(Some(found)) if self.validator.is_valid(&found) => {
                self.remember(word, &language, &found, WordSource::Dictionary);
                return Ok((found, WordSource::Dictionary));
            }
            Ok(Some(found)) => debug!(word, found = %found, "dictionary result rejected"),
            Ok(None) => debug!(word, "not in dictionary"),
            Err(e) => debug!(word, error = %e, "dictionary lookup failed, treating as not found"),
        }

        let translation = self.ask_model(word, line, &language).await?;
        self.remember(word, &language, &translation, WordSource::Ai);
        Ok((translation, WordSource::Ai))
    }

    async fn ask_model(&self, word: &str, line: &str, language: &str) -> Result<String, String> {
        let context = self.recent.lock().context_window(line);
        let reply = self
            .messenger
            .translate_word_with_context(word, &context, language, language_name(language))
            .await;
        match reply {
            Reply::Ok(t) if self.validator.is_valid(&t) => Ok(t.trim().to_string()),
            Reply::Ok(t) => {
                warn!(word, reply = %t, "AI word translation rejected by validator");
                Err(format!("No usable translation for \"{word}\""))
            }
            Reply::Failed(e) => Err(e),
            Reply::ContextInvalidated => Err("Extension was reloaded; refresh the page".to_string()),
        }
    }

    /// Tier 1, then tier 2. Entries failing the validator are purged from both.
    fn cached(&self, word: &str, language: &str) -> Option<String> {
        let key = WordTranslation::cache_key(word, language);
        {
            let mut tier1 = self.tier1.lock();
            if let Some(hit) = tier1.get(&key) {
                if self.validator.is_valid(&hit.translation) {
                    return Some(hit.translation.clone());
                }
                tier1.pop(&key);
            }
        }

        let store = self.store.as_ref()?;
        let entry = match store.get_word_translation(word, language) {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, word, "word cache read failed");
                return None;
            }
        };
        if !self.validator.is_valid(&entry.translation) {
            info!(key = %key, translation = %entry.translation, "purging invalid cached word translation");
            if let Err(e) = store.delete_word_translation(word, language) {
                warn!(error = %e, word, "failed to purge invalid word translation");
            }
            return None;
        }
        let translation = entry.translation.clone();
        self.tier1.lock().put(key, entry);
        Some(translation)
    }

    fn remember(&self, word: &str, language: &str, translation: &str, source: WordSource) {
        let entry = WordTranslation {
            word: word.to_string(),
            target_language: language.to_string(),
            translation: translation.to_string(),
            source,
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save_word_translation(&entry) {
                warn!(error = %e, word, "word translation not persisted");
            }
        }
        self.tier1
            .lock()
            .put(WordTranslation::cache_key(word, language), entry);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeDictionary {
        pub entries: Mutex<HashMap<String, String>>,
        pub lookups: Mutex<Vec<String>>,
    }

    impl FakeDictionary {
        pub fn with(word: &str, translation: &str) -> Self {
            let dict = Self::default();
            dict.entries.lock().insert(word.into(), translation.into());
            dict
        }
    }

    #[async_trait]
    impl Dictionary for FakeDictionary {
        async fn lookup(&self, word: &str, _target: &str) -> Result<Option<String>, TranslateError> {
            self.lookups.lock().push(word.to_string());
            Ok(self.entries.lock().get(word).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDictionary;
    use super::*;
    use crate::state_machine::TooltipAction;
    use crate::translate::glossary::TranslationValidator;
    use crate::translate::testing::{Call, FakeBackground};

    struct Fixture {
        store: Arc<SubtitleStore>,
        dictionary: Arc<FakeDictionary>,
        background: Arc<FakeBackground>,
        recent: Arc<Mutex<RecentLines>>,
        service: WordLookupService,
    }

    fn fixture(dictionary: FakeDictionary) -> Fixture {
        let store = Arc::new(SubtitleStore::open_in_memory().unwrap());
        let dictionary = Arc::new(dictionary);
        let background = Arc::new(FakeBackground::default());
        let recent = Arc::new(Mutex::new(RecentLines::default()));
        let service = WordLookupService::new(
            Some(Arc::clone(&store)),
            dictionary.clone(),
            Messenger::new(background.clone()),
            Arc::new(TranslationValidator::default()),
            Arc::clone(&recent),
            "EN-US",
        );
        Fixture {
            store,
            dictionary,
            background,
            recent,
            service,
        }
    }

    fn click(word: &str, token_index: usize, line: &str) -> WordClick {
        WordClick {
            word: word.into(),
            anchor: WordAnchor {
                line_id: "line-1".into(),
                token_index,
            },
            line: line.into(),
        }
    }

    #[tokio::test]
    async fn invalid_cached_entry_is_purged_and_refetched() {
        let fx = fixture(FakeDictionary::with("talo", "house"));
        fx.store
            .save_word_translation(&WordTranslation {
                word: "talo".into(),
                target_language: "EN-US".into(),
                translation: "please provide more context".into(),
                source: WordSource::Ai,
            })
            .unwrap();

        let outcome = fx.service.on_word_click(click("Talo,", 0, "Iso talo, pieni piha")).await;

        assert_eq!(outcome, LookupOutcome::Resolved(WordSource::Dictionary));
        assert_eq!(*fx.dictionary.lookups.lock(), vec!["talo".to_string()]);
        let stored = fx.store.get_word_translation("talo", "EN-US").unwrap().unwrap();
        assert_eq!(stored.translation, "house");
        assert_eq!(stored.source, WordSource::Dictionary);
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let fx = fixture(FakeDictionary::with("talo", "house"));
        fx.service.on_word_click(click("talo", 0, "talo")).await;
        fx.service.close();
        let outcome = fx.service.on_word_click(click("talo", 0, "talo")).await;
        assert_eq!(outcome, LookupOutcome::Resolved(WordSource::Cache));
        assert_eq!(fx.dictionary.lookups.lock().len(), 1);
        assert_eq!(fx.service.current().unwrap().actions(), vec![TooltipAction::AskAi]);
    }

    #[tokio::test]
    async fn reclick_toggles_and_other_word_replaces() {
        let fx = fixture(FakeDictionary::with("talo", "house"));
        fx.dictionary.entries.lock().insert("piha".into(), "yard".into());

        fx.service.on_word_click(click("talo", 1, "Iso talo, pieni piha")).await;
        let other = fx.service.on_word_click(click("piha", 5, "Iso talo, pieni piha")).await;
        assert_eq!(other, LookupOutcome::Resolved(WordSource::Dictionary));
        assert_eq!(fx.service.current().unwrap().word, "piha");

        let again = fx.service.on_word_click(click("piha", 5, "Iso talo, pieni piha")).await;
        assert_eq!(again, LookupOutcome::Closed);
        assert!(fx.service.current().is_none());
    }

    #[tokio::test]
    async fn dictionary_miss_falls_back_to_ai_with_context() {
        let fx = fixture(FakeDictionary::default());
        {
            let mut recent = fx.recent.lock();
            for line in ["a", "b", "c", "d", "e", "f"] {
                recent.push(line);
            }
        }
        fx.background.push_word_reply(Reply::Ok("sauna".into()));

        let outcome = fx.service.on_word_click(click("löyly", 0, "c")).await;

        assert_eq!(outcome, LookupOutcome::Resolved(WordSource::Ai));
        assert_eq!(
            fx.background.calls(),
            vec![Call::Word {
                word: "löyly".into(),
                context: "a\nb\nc\nd\ne".into()
            }]
        );
        assert!(fx.service.current().unwrap().actions().is_empty());
    }

    #[tokio::test]
    async fn ask_ai_overwrites_cached_entry() {
        let fx = fixture(FakeDictionary::with("kuusi", "six"));
        fx.service.on_word_click(click("kuusi", 0, "Kuusi metsässä")).await;
        fx.background.push_word_reply(Reply::Ok("spruce".into()));

        assert_eq!(fx.service.ask_ai().await, LookupOutcome::Resolved(WordSource::Ai));
        assert_eq!(fx.service.current().unwrap().translation.as_deref(), Some("spruce"));
        let stored = fx.store.get_word_translation("kuusi", "EN-US").unwrap().unwrap();
        assert_eq!((stored.translation.as_str(), stored.source), ("spruce", WordSource::Ai));
    }

    #[tokio::test]
    async fn total_failure_shows_error_then_retry_recovers() {
        let fx = fixture(FakeDictionary::default());
        fx.background.push_word_reply(Reply::Failed("provider down".into()));

        let outcome = fx.service.on_word_click(click("outo", 0, "outo")).await;
        assert_eq!(outcome, LookupOutcome::Failed("provider down".into()));
        assert_eq!(fx.service.current().unwrap().actions(), vec![TooltipAction::Retry]);

        fx.background.push_word_reply(Reply::Ok("strange".into()));
        assert_eq!(fx.service.retry().await, LookupOutcome::Resolved(WordSource::Ai));
    }

    #[tokio::test]
    async fn refusal_from_ai_is_not_cached() {
        let fx = fixture(FakeDictionary::default());
        fx.background.push_word_reply(Reply::Ok("I'm sorry, I cannot translate this".into()));

        let outcome = fx.service.on_word_click(click("sana", 0, "sana")).await;
        assert!(matches!(outcome, LookupOutcome::Failed(_)));
        assert!(fx.store.get_word_translation("sana", "EN-US").unwrap().is_none());
    }

    #[tokio::test]
    async fn navigation_keys_close() {
        let fx = fixture(FakeDictionary::with("talo", "house"));
        fx.service.on_word_click(click("talo", 0, "talo")).await;
        assert!(!fx.service.on_key("a"));
        assert!(fx.service.on_key("Escape"));
        assert!(fx.service.current().is_none());
    }

    #[tokio::test]
    async fn clear_word_cache_reaches_every_tier() {
        let fx = fixture(FakeDictionary::with("talo", "house"));
        fx.service.on_word_click(click("talo", 0, "talo")).await;
        fx.service.clear_word_cache().await;

        assert!(fx.store.get_word_translation("talo", "EN-US").unwrap().is_none());
        assert!(fx.background.calls().contains(&Call::ClearWords));
        fx.service.close();
        fx.service.on_word_click(click("talo", 0, "talo")).await;
        assert_eq!(fx.dictionary.lookups.lock().len(), 2);
    }

    #[test]
    fn tooltip_sits_above_and_clamps_horizontally() {
        let viewport = Size {
            width: 800.0,
            height: 600.0,
        };
        let tip = Size {
            width: 200.0,
            height: 80.0,
        };
        let anchor = Rect {
            x: 10.0,
            y: 400.0,
            width: 40.0,
            height: 20.0,
        };
        let placed = position_tooltip(anchor, tip, viewport);
        assert!(!placed.below);
        assert_eq!(placed.top, 400.0 - TOOLTIP_GAP - 80.0);
        assert_eq!(placed.left, VIEWPORT_MARGIN);

        let right_edge = Rect { x: 780.0, ..anchor };
        let placed = position_tooltip(right_edge, tip, viewport);
        assert_eq!(placed.left, 800.0 - VIEWPORT_MARGIN - 200.0);
    }

    #[test]
    fn tooltip_flips_below_near_top() {
        let placed = position_tooltip(
            Rect {
                x: 300.0,
                y: 30.0,
                width: 40.0,
                height: 20.0,
            },
            Size {
                width: 100.0,
                height: 80.0,
            },
            Size {
                width: 800.0,
                height: 600.0,
            },
        );
        assert!(placed.below);
        assert_eq!(placed.top, 30.0 + 20.0 + TOOLTIP_GAP);
        assert_eq!(placed.left, 270.0);
    }
}
