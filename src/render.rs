//! Shadow subtitle rendering.
//! The page's own subtitle container is hidden, never removed; a single wrapper
//! next to it (same class, so page styling applies) shows the original line as
//! clickable word tokens plus the translated line. A line that is not cached
//! yet renders a placeholder that is patched in place when the cache write for
//! its key lands, or falls back to the original text after 15 s.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::history::RecentLines;
use crate::state_machine::LineState;
use crate::timeline::{Navigator, Player};
use crate::translate::cache::{CachedLine, Lookup, TranslationCache};
use crate::translate::normalize::{is_trivial, tokenize, SubtitleLine, Token};
use crate::translate::queue::{PushOutcome, TranslationQueue};

pub const PENDING_TIMEOUT: Duration = Duration::from_secs(15);
/// Class used when the original container has none.
pub const DEFAULT_WRAPPER_CLASS: &str = "dualsub-wrapper";

/// The page surface around the recognized subtitle container.
pub trait SubtitleDom: Send + Sync {
    /// Concatenated text of the original container, `None` if it is not on the page.
    fn original_text(&self) -> Option<String>;
    fn original_class(&self) -> Option<String>;
    fn set_original_hidden(&self, hidden: bool);
    fn wrapper_exists(&self) -> bool;
    /// Create the shadow wrapper as a sibling of the original container.
    fn mount_wrapper(&self, class: &str);
    fn unmount_wrapper(&self);
    /// Replace the wrapper's content.
    fn render(&self, view: &SubtitleView);
    /// Swap the translated line of view `id`. False when that view was replaced.
    fn patch_translation(&self, id: &str, line: &TranslatedLine) -> bool;
    /// Title of the playing video, used as the movie partition key.
    fn movie_title(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FallbackReason {
    TimedOut,
    TranslationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TranslatedLine {
    Pending,
    Resolved(String),
    Fallback { text: String, reason: FallbackReason },
}

impl TranslatedLine {
    fn from_cached(line: CachedLine) -> Self {
        match line {
            CachedLine::Translated(text) => TranslatedLine::Resolved(text),
            CachedLine::Fallback(text) => TranslatedLine::Fallback {
                text,
                reason: FallbackReason::TranslationFailed,
            },
        }
    }
}

/// Everything the wrapper shows for one subtitle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleView {
    /// Unique per render; later patches target it.
    pub id: String,
    /// Full original line, attached to every word token for lookup context.
    pub line: String,
    pub tokens: Vec<Token>,
    pub translated: TranslatedLine,
}

impl SubtitleView {
    fn empty(id: String) -> Self {
        Self {
            id,
            line: String::new(),
            tokens: Vec::new(),
            translated: TranslatedLine::Resolved(String::new()),
        }
    }
}

/// A rendered placeholder awaiting its translation.
#[derive(Debug)]
pub struct PendingLine {
    pub id: String,
    pub line: SubtitleLine,
    rx: oneshot::Receiver<CachedLine>,
    guard: GenerationGuard,
}

#[derive(Debug)]
pub enum RenderOutcome {
    /// Container missing or empty.
    Cleared,
    Resolved { id: String, state: LineState },
    Pending(PendingLine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Settled(LineState),
    /// A newer subtitle replaced the placeholder first.
    Superseded,
}

pub struct SubtitleRenderer {
    dom: Arc<dyn SubtitleDom>,
    player: Arc<dyn Player>,
    cache: Arc<TranslationCache>,
    queue: TranslationQueue,
    navigator: Arc<Navigator>,
    recent: Arc<Mutex<RecentLines>>,
    generations: TaskGeneration,
    timeout: Duration,
}

impl SubtitleRenderer {
    pub fn new(
        dom: Arc<dyn SubtitleDom>,
        player: Arc<dyn Player>,
        cache: Arc<TranslationCache>,
        queue: TranslationQueue,
        navigator: Arc<Navigator>,
        recent: Arc<Mutex<RecentLines>>,
    ) -> Self {
        Self {
            dom,
            player,
            cache,
            queue,
            navigator,
            recent,
            generations: TaskGeneration::new(),
            timeout: PENDING_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mount the wrapper once and hide the original container.
    fn ensure_wrapper(&self) {
        if self.dom.wrapper_exists() {
            return;
        }
        let class = self
            .dom
            .original_class()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WRAPPER_CLASS.to_string());
        self.dom.mount_wrapper(&class);
        self.dom.set_original_hidden(true);
        info!(class = %class, "shadow subtitle wrapper mounted");
    }

    /// Render the original container's current line. Cached lines resolve
    /// immediately; others render a placeholder and are queued.
    pub fn handle_subtitle_change(&self) -> RenderOutcome {
        let guard = self.generations.advance();
        let id = uuid::Uuid::new_v4().to_string();

        let raw = self.dom.original_text().unwrap_or_default();
        let line = SubtitleLine::new(raw.trim());
        if line.is_empty() {
            if self.dom.wrapper_exists() {
                self.dom.render(&SubtitleView::empty(id));
            }
            return RenderOutcome::Cleared;
        }

        self.ensure_wrapper();
        self.recent.lock().push(&line.raw_text);

        let lookup = if is_trivial(&line.raw_text) {
            self.cache.store_identity(&line.normalized_key, &line.raw_text);
            Lookup::Ready(CachedLine::Translated(line.raw_text.clone()))
        } else {
            self.cache.subscribe(&line.normalized_key)
        };

        let tokens = tokenize(&line.raw_text);
        match lookup {
            Lookup::Ready(cached) => {
                let success = !cached.is_fallback();
                self.dom.render(&SubtitleView {
                    id: id.clone(),
                    line: line.raw_text.clone(),
                    tokens,
                    translated: TranslatedLine::from_cached(cached),
                });
                if success {
                    self.navigator.on_line_resolved(self.player.as_ref(), &line.raw_text);
                }
                RenderOutcome::Resolved {
                    id,
                    state: if success { LineState::Resolved } else { LineState::TimedOut },
                }
            }
            Lookup::Pending(rx) => {
                self.dom.render(&SubtitleView {
                    id: id.clone(),
                    line: line.raw_text.clone(),
                    tokens,
                    translated: TranslatedLine::Pending,
                });
                match self.queue.push(&line.raw_text) {
                    PushOutcome::Queued | PushOutcome::AlreadyQueued => {}
                    other => debug!(?other, "pending line not queued"),
                }
                RenderOutcome::Pending(PendingLine {
                    id,
                    line,
                    rx,
                    guard,
                })
            }
        }
    }

    /// Wait for the placeholder's translation, racing the timeout and any newer
    /// subtitle, and patch the rendered node.
    pub async fn await_translation(&self, pending: PendingLine) -> ResolveOutcome {
        let PendingLine { id, line, rx, guard } = pending;

        let settled = tokio::select! {
            biased;
            _ = guard.token().cancelled() => None,
            result = tokio::time::timeout(self.timeout, rx) => Some(result),
        };

        let Some(result) = settled else {
            debug!(id = %id, "pending line superseded");
            return ResolveOutcome::Superseded;
        };

        let (patch, state) = match result {
            Ok(Ok(cached)) => {
                let success = !cached.is_fallback();
                let patch = TranslatedLine::from_cached(cached);
                (patch, if success { LineState::Resolved } else { LineState::TimedOut })
            }
            Ok(Err(_)) | Err(_) => {
                warn!(key = %line.normalized_key, "translation wait expired, showing original");
                (
                    TranslatedLine::Fallback {
                        text: line.raw_text.clone(),
                        reason: FallbackReason::TimedOut,
                    },
                    LineState::TimedOut,
                )
            }
        };

        if !guard.should_continue() || !self.dom.patch_translation(&id, &patch) {
            return ResolveOutcome::Superseded;
        }
        if let TranslatedLine::Resolved(_) = patch {
            self.navigator.on_line_resolved(self.player.as_ref(), &line.raw_text);
        }
        ResolveOutcome::Settled(state)
    }

    /// Stop every pending wait; their placeholders are left as they are.
    pub fn cancel_pending(&self) {
        self.generations.cancel_all();
    }

    /// Remove the wrapper and show the page's own subtitles again.
    pub fn teardown(&self) {
        self.cancel_pending();
        if self.dom.wrapper_exists() {
            self.dom.unmount_wrapper();
        }
        self.dom.set_original_hidden(false);
        info!("shadow subtitle wrapper removed");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory page used by renderer and session tests.

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemoryDom {
        pub original: Mutex<Option<String>>,
        pub class: Mutex<Option<String>>,
        pub title: Mutex<Option<String>>,
        pub original_hidden: Mutex<bool>,
        pub wrapper_class: Mutex<Option<String>>,
        pub mounts: Mutex<usize>,
        pub view: Mutex<Option<SubtitleView>>,
    }

    impl MemoryDom {
        pub fn showing(text: &str) -> Self {
            let dom = Self::default();
            dom.set_text(text);
            *dom.class.lock() = Some("player-timedtext".into());
            dom
        }

        pub fn set_text(&self, text: &str) {
            *self.original.lock() = Some(text.to_string());
        }

        pub fn translated(&self) -> Option<TranslatedLine> {
            self.view.lock().as_ref().map(|v| v.translated.clone())
        }
    }

    impl SubtitleDom for MemoryDom {
        fn original_text(&self) -> Option<String> {
            self.original.lock().clone()
        }
        fn original_class(&self) -> Option<String> {
            self.class.lock().clone()
        }
        fn set_original_hidden(&self, hidden: bool) {
            *self.original_hidden.lock() = hidden;
        }
        fn wrapper_exists(&self) -> bool {
            self.wrapper_class.lock().is_some()
        }
        fn mount_wrapper(&self, class: &str) {
            *self.wrapper_class.lock() = Some(class.to_string());
            *self.mounts.lock() += 1;
        }
        fn unmount_wrapper(&self) {
            *self.wrapper_class.lock() = None;
            *self.view.lock() = None;
        }
        fn render(&self, view: &SubtitleView) {
            *self.view.lock() = Some(view.clone());
        }
        fn patch_translation(&self, id: &str, line: &TranslatedLine) -> bool {
            match self.view.lock().as_mut() {
                Some(view) if view.id == id => {
                    view.translated = line.clone();
                    true
                }
                _ => false,
            }
        }
        fn movie_title(&self) -> Option<String> {
            self.title.lock().clone()
        }
    }
}
