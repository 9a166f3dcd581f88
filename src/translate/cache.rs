//! Two-tier line translation cache.
//! Tier 1: process-lifetime map keyed by normalized line.
//! Tier 2: SQLite store partitioned by (movie, target language).
//! Lookup order is tier 1 → tier 2 → provider. Renderers waiting on a key get a
//! one-shot notification the moment any entry for that key is written.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::store::{SubtitleStore, TranslationRecord};

/// A tier-1 entry. Fallback entries hold the original text after a failed
/// translation; they live in tier 1 only and yield to any later success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLine {
    Translated(String),
    Fallback(String),
}

impl CachedLine {
    pub fn text(&self) -> &str {
        match self {
            CachedLine::Translated(t) | CachedLine::Fallback(t) => t,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CachedLine::Fallback(_))
    }
}

/// Result of [`TranslationCache::subscribe`].
#[derive(Debug)]
pub enum Lookup {
    Ready(CachedLine),
    Pending(oneshot::Receiver<CachedLine>),
}

#[derive(Default)]
struct Tier1 {
    entries: HashMap<String, CachedLine>,
    waiters: HashMap<String, Vec<oneshot::Sender<CachedLine>>>,
}

impl Tier1 {
    fn put(&mut self, key: &str, value: CachedLine) {
        if let Some(waiters) = self.waiters.remove(key) {
            for tx in waiters {
                let _ = tx.send(value.clone());
            }
        }
        self.entries.insert(key.to_string(), value);
        self.prune_waiters();
    }

    /// Drop waiters whose receiver is gone (timed out or superseded renders).
    fn prune_waiters(&mut self) {
        self.waiters.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
    }
}

/// Movie and target language a write belongs to. Captured before a provider
/// call so results can be checked against the context they were asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContext {
    pub movie: Option<String>,
    pub target_language: String,
}

pub struct TranslationCache {
    tier1: Mutex<Tier1>,
    store: Option<Arc<SubtitleStore>>,
    context: RwLock<CacheContext>,
}

impl TranslationCache {
    pub fn new(store: Option<Arc<SubtitleStore>>, target_language: &str) -> Self {
        Self {
            tier1: Mutex::new(Tier1::default()),
            store,
            context: RwLock::new(CacheContext {
                movie: None,
                target_language: target_language.to_string(),
            }),
        }
    }

    pub fn current_movie(&self) -> Option<String> {
        self.context.read().movie.clone()
    }

    pub fn target_language(&self) -> String {
        self.context.read().target_language.clone()
    }

    pub fn context(&self) -> CacheContext {
        self.context.read().clone()
    }

    /// Registered renderer waiters, across all keys.
    pub fn waiter_count(&self) -> usize {
        self.tier1.lock().waiters.values().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.tier1.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tier 1 only.
    pub fn peek(&self, key: &str) -> Option<CachedLine> {
        self.tier1.lock().entries.get(key).cloned()
    }

    /// Tier 1, then tier 2. A tier-2 hit is promoted into tier 1.
    pub fn get(&self, key: &str) -> Option<CachedLine> {
        if let Some(hit) = self.peek(key) {
            return Some(hit);
        }
        let translated = self.load_tier2(key)?;
        let value = CachedLine::Translated(translated);
        self.tier1.lock().put(key, value.clone());
        debug!(key, "tier-2 hit promoted");
        Some(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Resolve `key` now, or register a one-shot waiter fired by the next write.
    pub fn subscribe(&self, key: &str) -> Lookup {
        if let Some(hit) = self.get(key) {
            return Lookup::Ready(hit);
        }
        let mut tier1 = self.tier1.lock();
        // A write may have landed between the miss above and taking the lock.
        if let Some(hit) = tier1.entries.get(key) {
            return Lookup::Ready(hit.clone());
        }
        tier1.prune_waiters();
        let (tx, rx) = oneshot::channel();
        tier1.waiters.entry(key.to_string()).or_default().push(tx);
        Lookup::Pending(rx)
    }

    /// Successful provider result: written to tier 1 and, with a movie context, tier 2.
    pub fn store_translation(&self, key: &str, translated: &str) {
        let ctx = self.context();
        self.store_translations_in(&ctx, &[(key.to_string(), translated.to_string())]);
    }

    /// Batch form of [`store_translation`](Self::store_translation) against the current context.
    pub fn store_translations(&self, pairs: &[(String, String)]) {
        let ctx = self.context();
        self.store_translations_in(&ctx, pairs);
    }

    /// Write results requested under `ctx`; one tier-2 transaction. If the movie
    /// or language changed since, tier 1 is left alone and the rows go to the
    /// partition they were translated for.
    pub fn store_translations_in(&self, ctx: &CacheContext, pairs: &[(String, String)]) {
        if pairs.is_empty() {
            return;
        }
        {
            let current = self.context.read();
            if *current == *ctx {
                let mut tier1 = self.tier1.lock();
                for (key, translated) in pairs {
                    tier1.put(key, CachedLine::Translated(translated.clone()));
                }
            } else {
                debug!(
                    count = pairs.len(),
                    requested = %ctx.target_language,
                    current = %current.target_language,
                    "context changed in flight, tier 1 untouched"
                );
            }
        }

        if let (Some(store), Some(movie)) = (&self.store, ctx.movie.as_deref()) {
            let records: Vec<TranslationRecord> = pairs
                .iter()
                .map(|(k, t)| TranslationRecord::new(movie, &ctx.target_language, k, t))
                .collect();
            if let Err(e) = store.save_subtitles_batch(&records) {
                warn!(error = %e, count = records.len(), "tier-2 batch write failed");
            }
        }
    }

    /// Identity translation for trivial lines. Tier 1 only.
    pub fn store_identity(&self, key: &str, raw: &str) {
        self.tier1
            .lock()
            .put(key, CachedLine::Translated(raw.trim().to_string()));
    }

    /// Fallback after a failed translation. Never replaces an existing entry.
    /// Returns whether the fallback was written.
    pub fn store_fallback(&self, key: &str, original: &str) -> bool {
        let ctx = self.context();
        self.store_fallback_in(&ctx, key, original)
    }

    /// Fallback for a request made under `ctx`; skipped once the context moved on.
    pub fn store_fallback_in(&self, ctx: &CacheContext, key: &str, original: &str) -> bool {
        let current = self.context.read();
        if *current != *ctx {
            return false;
        }
        let mut tier1 = self.tier1.lock();
        if tier1.entries.contains_key(key) {
            return false;
        }
        tier1.put(key, CachedLine::Fallback(original.trim().to_string()));
        true
    }

    /// Switch to a movie: tier 1 is reset and pre-seeded from tier 2.
    /// Returns the number of entries loaded.
    pub fn activate_movie(&self, movie: &str) -> usize {
        let target_language = {
            let mut ctx = self.context.write();
            ctx.movie = Some(movie.to_string());
            ctx.target_language.clone()
        };
        self.reload(movie, &target_language)
    }

    /// Switch target language; tier 1 is reset and, with a movie context, reloaded.
    pub fn set_target_language(&self, target_language: &str) -> usize {
        let movie = {
            let mut ctx = self.context.write();
            ctx.target_language = target_language.to_string();
            ctx.movie.clone()
        };
        match movie {
            Some(movie) => self.reload(&movie, target_language),
            None => {
                self.clear();
                0
            }
        }
    }

    /// Drop all tier-1 entries. Pending waiters stay registered.
    pub fn clear(&self) {
        self.tier1.lock().entries.clear();
    }

    /// Movie or language switch. Live waiters stay so a render still on screen
    /// resolves from a write under the new context; abandoned ones are dropped.
    fn reload(&self, movie: &str, target_language: &str) -> usize {
        {
            let mut tier1 = self.tier1.lock();
            tier1.entries.clear();
            tier1.prune_waiters();
        }
        let Some(store) = &self.store else {
            return 0;
        };
        match store.load_subtitles_by_movie_name(movie, target_language) {
            Ok(records) => {
                let mut tier1 = self.tier1.lock();
                for record in &records {
                    tier1.put(
                        &record.original_text,
                        CachedLine::Translated(record.translated_text.clone()),
                    );
                }
                info!(movie, target_language, loaded = records.len(), "tier 1 seeded from tier 2");
                records.len()
            }
            Err(e) => {
                warn!(error = %e, movie, "tier-2 load failed, starting with empty tier 1");
                0
            }
        }
    }

    fn load_tier2(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        let ctx = self.context.read().clone();
        let movie = ctx.movie.as_deref()?;
        match store.get_subtitle(movie, &ctx.target_language, key) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, key, "tier-2 read failed");
                None
            }
        }
    }
}
