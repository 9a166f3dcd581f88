//! Incremental translation queue for live subtitle lines.
//! FIFO, drained in batches of 7 with a single batch in flight. Draining is
//! suspended while batch pre-translation owns the event stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::batch::BatchGate;
use super::cache::{CacheContext, TranslationCache};
use super::normalize::{is_trivial, normalized_key};
use super::{Messenger, Reply};

pub const QUEUE_BATCH_SIZE: usize = 7;

/// What [`TranslationQueue::push`] did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Empty,
    /// Resolved to itself without a provider call.
    Trivial,
    AlreadyCached,
    AlreadyQueued,
    Queued,
}

struct QueueInner {
    items: Mutex<VecDeque<String>>,
    processing: AtomicBool,
    enabled: AtomicBool,
    idle: Notify,
    gate: BatchGate,
    cache: Arc<TranslationCache>,
    messenger: Messenger,
}

/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct TranslationQueue {
    inner: Arc<QueueInner>,
}

/// Clears the processing flag however the drain ends.
struct ProcessingGuard<'a> {
    inner: &'a QueueInner,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.inner.processing.store(false, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
    }
}

impl TranslationQueue {
    pub fn new(cache: Arc<TranslationCache>, messenger: Messenger, gate: BatchGate) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                idle: Notify::new(),
                gate,
                cache,
                messenger,
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.items.lock().clear();
    }

    /// Queue a raw line unless it is trivial, cached, or already waiting.
    pub fn push(&self, raw: &str) -> PushOutcome {
        let key = normalized_key(raw);
        if key.is_empty() {
            return PushOutcome::Empty;
        }
        if is_trivial(raw) {
            self.inner.cache.store_identity(&key, raw);
            return PushOutcome::Trivial;
        }
        if self.inner.cache.contains(&key) {
            return PushOutcome::AlreadyCached;
        }
        let mut items = self.inner.items.lock();
        if items.iter().any(|queued| normalized_key(queued) == key) {
            return PushOutcome::AlreadyQueued;
        }
        items.push_back(raw.trim().to_string());
        debug!(key = %key, queued = items.len(), "line queued");
        PushOutcome::Queued
    }

    /// Wait until no queue batch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_processing() {
                return;
            }
            notified.await;
        }
    }

    /// Drain the queue batch by batch. Returns immediately when disabled, when
    /// batch pre-translation is active, or when another drain is in flight.
    pub async fn drain(&self) {
        loop {
            if !self.is_enabled() {
                debug!("queue drain skipped: disabled");
                return;
            }
            if self.inner.gate.is_active() {
                debug!("queue drain skipped: batch pre-translation active");
                return;
            }
            if self.inner.processing.swap(true, Ordering::SeqCst) {
                return;
            }
            let _guard = ProcessingGuard { inner: &self.inner };
            // A batch may have taken the gate between the check and the swap.
            // It waits on `idle`, which the guard signals on return.
            if self.inner.gate.is_active() {
                debug!("queue drain yielded to batch pre-translation");
                return;
            }

            let batch = self.take_batch();
            if batch.is_empty() {
                return;
            }
            self.dispatch(batch).await;
        }
    }

    /// Up to [`QUEUE_BATCH_SIZE`] lines, dropping any that got cached while waiting.
    fn take_batch(&self) -> Vec<String> {
        let mut items = self.inner.items.lock();
        let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
        while batch.len() < QUEUE_BATCH_SIZE {
            let Some(line) = items.pop_front() else {
                break;
            };
            if self.inner.cache.peek(&normalized_key(&line)).is_some() {
                continue;
            }
            batch.push(line);
        }
        batch
    }

    async fn dispatch(&self, batch: Vec<String>) {
        let ctx = self.inner.cache.context();
        let reply = self
            .inner
            .messenger
            .fetch_translation(&batch, &ctx.target_language)
            .await;

        match reply {
            Reply::Ok(results) => {
                let outcome = write_results(&self.inner.cache, &ctx, &batch, &results);
                info!(
                    sent = batch.len(),
                    translated = outcome.translated,
                    fallback = outcome.fallback,
                    "queue batch translated"
                );
            }
            Reply::Failed(error) => {
                warn!(error = %error, count = batch.len(), "queue batch failed, writing fallbacks");
                write_fallbacks(&self.inner.cache, &ctx, &batch);
            }
            Reply::ContextInvalidated => {
                write_fallbacks(&self.inner.cache, &ctx, &batch);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteOutcome {
    pub translated: usize,
    pub fallback: usize,
}

/// Map provider results back to their lines by position. Missing or blank
/// positions get fallbacks. `ctx` is the context the lines were sent under.
pub(crate) fn write_results(
    cache: &TranslationCache,
    ctx: &CacheContext,
    lines: &[String],
    results: &[String],
) -> WriteOutcome {
    let mut outcome = WriteOutcome::default();
    let mut pairs = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let key = normalized_key(line);
        match results.get(i).map(|t| t.trim()) {
            Some(translated) if !translated.is_empty() => {
                pairs.push((key, translated.to_string()));
                outcome.translated += 1;
            }
            _ => {
                if cache.store_fallback_in(ctx, &key, line) {
                    outcome.fallback += 1;
                }
            }
        }
    }
    if results.len() != lines.len() {
        warn!(sent = lines.len(), received = results.len(), "provider reply length mismatch");
    }
    cache.store_translations_in(ctx, &pairs);
    outcome
}

/// Fallback entries for every line that has no cache entry yet.
pub(crate) fn write_fallbacks(cache: &TranslationCache, ctx: &CacheContext, lines: &[String]) -> usize {
    lines
        .iter()
        .filter(|line| cache.store_fallback_in(ctx, &normalized_key(line), line))
        .count()
}
