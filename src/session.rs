//! One augmentation session per page.
//! Owns every component, wires them to the event bus and to settings changes,
//! and drives the movie lifecycle. Host glue feeds mutation records, track
//! loads, word clicks and control presses in; the traits in `render`,
//! `timeline` and `observer` carry the page back out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Settings, SettingsStore};
use crate::history::RecentLines;
use crate::lookup::{Dictionary, LookupOutcome, WordClick, WordLookupService};
use crate::observer::{augment_player, ControlSurface, DomObserver, MutationRecord, AUGMENT_ATTEMPTS, AUGMENT_INTERVAL};
use crate::render::{RenderOutcome, ResolveOutcome, SubtitleDom, SubtitleRenderer};
use crate::scheduler::{event_bus, run_event_loop, EventHandler, EventReceiver, EventSender, PageEvent};
use crate::timeline::{Navigator, Player, TimestampIndex};
use crate::translate::batch::{BatchGate, BatchOutcome, BatchPretranslator, Progress, TrackCue};
use crate::translate::cache::TranslationCache;
use crate::translate::deepseek::HttpBackground;
use crate::translate::dictionary::HttpDictionary;
use crate::translate::glossary::{TranslationValidator, Validator};
use crate::translate::queue::TranslationQueue;
use crate::translate::store::{MovieMetadata, SubtitleStore};
use crate::translate::{Background, Messenger, Reply, TranslateError};

/// Everything the session talks to outside of itself.
pub struct Collaborators {
    pub dom: Arc<dyn SubtitleDom>,
    pub player: Arc<dyn Player>,
    pub controls: Arc<dyn ControlSurface>,
    pub background: Arc<dyn Background>,
    pub dictionary: Arc<dyn Dictionary>,
    pub store: Option<Arc<SubtitleStore>>,
    pub validator: Arc<dyn Validator>,
}

impl Collaborators {
    /// Build the network and storage collaborators from settings. Page-side
    /// collaborators come from the host.
    pub fn from_settings(
        settings: &Settings,
        dom: Arc<dyn SubtitleDom>,
        player: Arc<dyn Player>,
        controls: Arc<dyn ControlSurface>,
    ) -> Result<Self, TranslateError> {
        Ok(Self {
            dom,
            player,
            controls,
            background: Arc::new(HttpBackground::from_settings(settings)?),
            dictionary: Arc::new(HttpDictionary::new(&settings.dictionary_base_url)?),
            store: settings.database_path.as_deref().and_then(open_store),
            validator: Arc::new(load_validator(settings.invalid_patterns_path.as_deref())),
        })
    }
}

fn open_store(path: &Path) -> Option<Arc<SubtitleStore>> {
    match SubtitleStore::open(path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "persistent cache unavailable, running memory-only");
            None
        }
    }
}

fn load_validator(path: Option<&Path>) -> TranslationValidator {
    let Some(path) = path else {
        return TranslationValidator::default();
    };
    TranslationValidator::load_from_file(path).unwrap_or_else(|e| {
        warn!(error = %e, path = %path.display(), "invalid-translation patterns not loaded, using defaults");
        TranslationValidator::default()
    })
}

struct SessionInner {
    settings: SettingsStore,
    dom: Arc<dyn SubtitleDom>,
    player: Arc<dyn Player>,
    controls: Arc<dyn ControlSurface>,
    store: Option<Arc<SubtitleStore>>,
    messenger: Messenger,
    cache: Arc<TranslationCache>,
    queue: TranslationQueue,
    batch: BatchPretranslator,
    navigator: Arc<Navigator>,
    recent: Arc<Mutex<RecentLines>>,
    renderer: SubtitleRenderer,
    lookup: WordLookupService,
    observer: DomObserver,
    bus: EventSender,
    events: Mutex<Option<EventReceiver>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct DualSubSession {
    inner: Arc<SessionInner>,
}

impl DualSubSession {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        let Collaborators {
            dom,
            player,
            controls,
            background,
            dictionary,
            store,
            validator,
        } = collaborators;

        let messenger = Messenger::new(background);
        let cache = Arc::new(TranslationCache::new(store.clone(), &settings.target_language));
        let gate = BatchGate::default();
        let queue = TranslationQueue::new(Arc::clone(&cache), messenger.clone(), gate.clone());
        queue.set_enabled(settings.dual_sub_enabled);

        let index = Arc::new(Mutex::new(TimestampIndex::new()));
        let navigator = Arc::new(Navigator::new(Arc::clone(&index), settings.auto_pause_enabled));
        let recent = Arc::new(Mutex::new(RecentLines::default()));

        let batch = BatchPretranslator::new(Arc::clone(&cache), messenger.clone(), gate, queue.clone(), index);
        let renderer = SubtitleRenderer::new(
            Arc::clone(&dom),
            Arc::clone(&player),
            Arc::clone(&cache),
            queue.clone(),
            Arc::clone(&navigator),
            Arc::clone(&recent),
        );
        let lookup = WordLookupService::new(
            store.clone(),
            dictionary,
            messenger.clone(),
            validator,
            Arc::clone(&recent),
            &settings.target_language,
        );

        let (bus, events) = event_bus();
        let observer = DomObserver::new(&settings.subtitle_marker, settings.dual_sub_enabled, bus.clone());

        Self {
            inner: Arc::new(SessionInner {
                settings: SettingsStore::new(settings),
                dom,
                player,
                controls,
                store,
                messenger,
                cache,
                queue,
                batch,
                navigator,
                recent,
                renderer,
                lookup,
                observer,
                bus,
                events: Mutex::new(Some(events)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Startup housekeeping, then the event loop. Returns `None` if already started.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        let events = self.inner.events.lock().take()?;
        let settings = self.inner.settings.current();

        if let Some(store) = &self.inner.store {
            match store.cleanup_old_movie_data(settings.cache_max_age_days) {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), max_age_days = settings.cache_max_age_days, "expired movie caches removed")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "movie cache cleanup failed"),
            }
        }

        if !settings.has_api_key() {
            warn!(provider = %settings.translation_provider, "no provider API key, opening settings");
            if let Reply::Failed(e) = self.inner.messenger.open_options_page().await {
                warn!(error = %e, "could not open settings page");
            }
        }

        let handler: Arc<dyn EventHandler> = Arc::new(self.clone());
        info!(target_language = %settings.target_language, "session started");
        Some(tokio::spawn(run_event_loop(events, handler, self.inner.cancel.clone())))
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn lookup(&self) -> &WordLookupService {
        &self.inner.lookup
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.inner.cache
    }

    pub fn subscribe_progress(&self) -> tokio::sync::watch::Receiver<Option<Progress>> {
        self.inner.batch.subscribe_progress()
    }

    /// Entry point for the page's mutation observer.
    pub fn on_mutations(&self, records: &[MutationRecord]) -> usize {
        self.inner.observer.on_mutations(records)
    }

    /// Render the current line and, when it is not cached yet, drain the queue
    /// while waiting for its translation. `None` when the container was empty.
    pub async fn process_subtitle(&self) -> Option<ResolveOutcome> {
        match self.inner.renderer.handle_subtitle_change() {
            RenderOutcome::Cleared => None,
            RenderOutcome::Resolved { state, .. } => Some(ResolveOutcome::Settled(state)),
            RenderOutcome::Pending(pending) => {
                let (_, outcome) = tokio::join!(
                    self.inner.queue.drain(),
                    self.inner.renderer.await_translation(pending)
                );
                Some(outcome)
            }
        }
    }

    /// New video on the page: partition the cache by its title, reset per-title
    /// state, apply playback speed and inject the controls in the background.
    /// Returns the number of cached lines pre-seeded from the persistent tier.
    pub fn activate_video(&self) -> usize {
        let inner = &self.inner;
        let movie = inner
            .dom
            .movie_title()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let loaded = match movie {
            Some(movie) => {
                if let Some(store) = &inner.store {
                    if let Err(e) = store.upsert_movie_metadata(&MovieMetadata::accessed_today(&movie)) {
                        warn!(error = %e, movie = %movie, "movie metadata not recorded");
                    }
                }
                let loaded = inner.cache.activate_movie(&movie);
                info!(movie = %movie, loaded, "movie activated");
                loaded
            }
            None => {
                debug!("video without a title, persistent tier not used");
                0
            }
        };

        // Work started for the previous video must not land on this one.
        inner.renderer.cancel_pending();
        inner.lookup.close();
        inner.batch.reset_track();
        inner.navigator.reset();
        inner.recent.lock().clear();
        inner.player.set_playback_rate(inner.settings.current().playback_speed);

        let controls = Arc::clone(&inner.controls);
        let cancel = inner.cancel.child_token();
        tokio::spawn(async move {
            augment_player(controls.as_ref(), AUGMENT_ATTEMPTS, AUGMENT_INTERVAL, &cancel).await;
        });
        loaded
    }

    /// The page finished loading a subtitle track.
    pub async fn on_track_loaded(&self, cues: Vec<TrackCue>) -> BatchOutcome {
        if !self.inner.settings.current().dual_sub_enabled {
            debug!("track loaded while dual subtitles are off, not pre-translating");
            return BatchOutcome::Disabled;
        }
        self.inner.batch.run(&cues).await
    }

    pub async fn on_word_click(&self, click: WordClick) -> LookupOutcome {
        self.inner.lookup.on_word_click(click).await
    }

    pub fn skip_forward(&self) -> f64 {
        self.inner.navigator.skip_forward(self.inner.player.as_ref())
    }

    pub fn skip_backward(&self) -> f64 {
        self.inner.navigator.skip_backward(self.inner.player.as_ref())
    }

    /// Change settings and apply whatever differs.
    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        let before = self.inner.settings.current();
        if self.inner.settings.update(f) {
            self.apply_changes(&before, &self.inner.settings.current());
        }
    }

    fn apply_changes(&self, before: &Settings, after: &Settings) {
        let inner = &self.inner;

        if before.dual_sub_enabled != after.dual_sub_enabled {
            inner.observer.set_dual_sub_enabled(after.dual_sub_enabled);
            inner.queue.set_enabled(after.dual_sub_enabled);
            if after.dual_sub_enabled {
                info!("dual subtitles enabled");
                inner.bus.send(PageEvent::SubtitleChanged);
            } else {
                info!("dual subtitles disabled");
                inner.queue.clear();
                inner.renderer.teardown();
            }
        }

        if before.target_language != after.target_language {
            inner.queue.clear();
            let loaded = inner.cache.set_target_language(&after.target_language);
            inner.batch.reset_track();
            inner.lookup.set_target_language(&after.target_language);
            info!(target_language = %after.target_language, loaded, "target language changed");
        }

        if before.auto_pause_enabled != after.auto_pause_enabled {
            inner.navigator.set_auto_pause(after.auto_pause_enabled);
        }

        if before.playback_speed != after.playback_speed {
            inner.player.set_playback_rate(after.playback_speed);
        }

        if before.provider_api_key != after.provider_api_key {
            info!("provider key changed, takes effect in the next session");
        }
    }

    /// Stop everything and restore the page.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.clear();
        self.inner.lookup.close();
        self.inner.renderer.teardown();
        info!("session stopped");
    }
}

#[async_trait]
impl EventHandler for DualSubSession {
    async fn on_subtitle_changed(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            session.process_subtitle().await;
        });
    }

    async fn on_video_appeared(&self) {
        self.activate_video();
    }
}
