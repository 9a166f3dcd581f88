//! Batch pre-translation of a whole subtitle track.
//! Runs once per loaded track: dedup against the cache, send chunks of 10
//! sequentially with a pause between them, then hand control back to the
//! incremental queue. While it runs the queue is gated off entirely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cache::{CachedLine, TranslationCache};
use super::normalize::{is_trivial, normalized_key};
use super::queue::{write_fallbacks, write_results, TranslationQueue};
use super::{Messenger, Reply};
use crate::timeline::TimestampIndex;

pub const BATCH_CHUNK_SIZE: usize = 10;
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(500);

/// Shared "batch pre-translation active" flag checked by the queue.
#[derive(Debug, Clone, Default)]
pub struct BatchGate(Arc<AtomicBool>);

impl BatchGate {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }

    /// Take the gate; false if a batch already holds it.
    fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One cue of a loaded subtitle track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCue {
    /// Seconds from the start of the video.
    pub start: f64,
    pub text: String,
}

impl TrackCue {
    pub fn new(start: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            text: text.into(),
        }
    }
}

/// Identity of a track, so the same track is never pre-translated twice.
pub fn track_fingerprint(cues: &[TrackCue]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for cue in cues {
        hasher.update(&cue.start.to_le_bytes());
        hasher.update(b"|");
        hasher.update(normalized_key(&cue.text).as_bytes());
        hasher.update(b"\n");
    }
    *hasher.finalize().as_bytes()
}

/// A line sent once, with every start time it appears at in the track.
#[derive(Debug)]
struct PendingCue {
    text: String,
    starts: Vec<f64>,
}

/// Lines done out of lines to send, for an on-screen indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Same track as the previous run.
    AlreadyTranslated,
    /// Another batch holds the gate.
    Busy,
    /// Dual subtitles are off.
    Disabled,
    Finished {
        chunks: usize,
        translated: usize,
        fallback: usize,
    },
}

/// Releases the gate and hides progress however the run ends.
struct ActiveRun<'a> {
    gate: &'a BatchGate,
    progress: &'a watch::Sender<Option<Progress>>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.gate.set_active(false);
        let _ = self.progress.send(None);
    }
}

pub struct BatchPretranslator {
    cache: Arc<TranslationCache>,
    messenger: Messenger,
    gate: BatchGate,
    queue: TranslationQueue,
    index: Arc<Mutex<TimestampIndex>>,
    progress_tx: watch::Sender<Option<Progress>>,
    last_track: Mutex<Option<[u8; 32]>>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl BatchPretranslator {
    pub fn new(
        cache: Arc<TranslationCache>,
        messenger: Messenger,
        gate: BatchGate,
        queue: TranslationQueue,
        index: Arc<Mutex<TimestampIndex>>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(None);
        Self {
            cache,
            messenger,
            gate,
            queue,
            index,
            progress_tx,
            last_track: Mutex::new(None),
            chunk_size: BATCH_CHUNK_SIZE,
            chunk_delay: INTER_CHUNK_DELAY,
        }
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    /// `None` while no batch is running.
    pub fn subscribe_progress(&self) -> watch::Receiver<Option<Progress>> {
        self.progress_tx.subscribe()
    }

    /// Forget the last track, e.g. after a target-language change.
    pub fn reset_track(&self) {
        *self.last_track.lock() = None;
    }

    pub async fn run(&self, cues: &[TrackCue]) -> BatchOutcome {
        let fingerprint = track_fingerprint(cues);
        if *self.last_track.lock() == Some(fingerprint) {
            debug!("track already pre-translated");
            return BatchOutcome::AlreadyTranslated;
        }
        if !self.gate.try_begin() {
            warn!("batch pre-translation already running");
            return BatchOutcome::Busy;
        }
        *self.last_track.lock() = Some(fingerprint);

        let outcome = {
            let _run = ActiveRun {
                gate: &self.gate,
                progress: &self.progress_tx,
            };
            // A queue batch may still be in flight from before the gate closed.
            self.queue.wait_idle().await;
            let outcome = self.translate_track(cues).await;
            self.index.lock().sort();
            outcome
        };

        // The gate is open again; flush lines that arrived meanwhile.
        self.queue.drain().await;
        outcome
    }

    async fn translate_track(&self, cues: &[TrackCue]) -> BatchOutcome {
        let pending = self.dedup(cues);
        let total = pending.len();
        let ctx = self.cache.context();
        let chunk_size = self.chunk_size.max(1);
        info!(cues = cues.len(), to_translate = total, "batch pre-translation started");

        let mut done = 0;
        let mut translated = 0;
        let mut fallback = 0;
        let mut chunks = 0;
        let _ = self.progress_tx.send(Some(Progress { current: 0, total }));

        for (i, chunk) in pending.chunks(chunk_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chunk_delay).await;
            }
            chunks += 1;
            let lines: Vec<String> = chunk.iter().map(|c| c.text.clone()).collect();
            let reply = self
                .messenger
                .fetch_batch_translation(&lines, &ctx.target_language, true)
                .await;

            match reply {
                Reply::Ok(results) => {
                    let written = write_results(&self.cache, &ctx, &lines, &results);
                    translated += written.translated;
                    fallback += written.fallback;
                    self.seed_index(chunk);
                }
                Reply::Failed(error) => {
                    warn!(error = %error, chunk = i, "batch chunk failed, writing fallbacks");
                    fallback += write_fallbacks(&self.cache, &ctx, &lines);
                }
                Reply::ContextInvalidated => {
                    let abandoned: Vec<String> =
                        pending[i * chunk_size..].iter().map(|c| c.text.clone()).collect();
                    fallback += write_fallbacks(&self.cache, &ctx, &abandoned);
                    warn!(
                        chunk = i,
                        abandoned = abandoned.len(),
                        "host context gone, abandoning batch pre-translation"
                    );
                    break;
                }
            }

            done += chunk.len();
            let _ = self.progress_tx.send(Some(Progress { current: done, total }));
        }

        info!(chunks, translated, fallback, "batch pre-translation finished");
        BatchOutcome::Finished {
            chunks,
            translated,
            fallback,
        }
    }

    /// One entry per uncached key in first-seen order, carrying every start
    /// time of that key. Cached cues are seeded into the index straight away.
    fn dedup(&self, cues: &[TrackCue]) -> Vec<PendingCue> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut pending: Vec<PendingCue> = Vec::new();
        let mut index = self.index.lock();
        for cue in cues {
            let key = normalized_key(&cue.text);
            if key.is_empty() {
                continue;
            }
            if is_trivial(&cue.text) {
                self.cache.store_identity(&key, &cue.text);
                continue;
            }
            if let Some(CachedLine::Translated(_)) = self.cache.get(&key) {
                index.seed(cue.start, cue.text.trim());
                continue;
            }
            match positions.get(&key) {
                Some(&at) => pending[at].starts.push(cue.start),
                None => {
                    positions.insert(key, pending.len());
                    pending.push(PendingCue {
                        text: cue.text.trim().to_string(),
                        starts: vec![cue.start],
                    });
                }
            }
        }
        pending
    }

    fn seed_index(&self, chunk: &[PendingCue]) {
        let mut index = self.index.lock();
        for cue in chunk {
            for &start in &cue.starts {
                index.seed(start, &cue.text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::translate::store::SubtitleStore;
    use crate::translate::testing::{Call, FakeBackground, LanguageSwitch};
    use crate::translate::Background;

    struct Fixture {
        fake: Arc<FakeBackground>,
        cache: Arc<TranslationCache>,
        queue: TranslationQueue,
        gate: BatchGate,
        index: Arc<Mutex<TimestampIndex>>,
        batch: Arc<BatchPretranslator>,
    }

    fn fixture(fake: FakeBackground) -> Fixture {
        let fake = Arc::new(fake);
        let cache = Arc::new(TranslationCache::new(None, "EN-US"));
        let gate = BatchGate::default();
        let messenger = Messenger::new(fake.clone());
        let queue = TranslationQueue::new(Arc::clone(&cache), messenger.clone(), gate.clone());
        let index = Arc::new(Mutex::new(TimestampIndex::new()));
        let batch = Arc::new(BatchPretranslator::new(
            Arc::clone(&cache),
            messenger,
            gate.clone(),
            queue.clone(),
            Arc::clone(&index),
        ));
        Fixture {
            fake,
            cache,
            queue,
            gate,
            index,
            batch,
        }
    }

    fn cues(n: usize) -> Vec<TrackCue> {
        (0..n)
            .map(|i| TrackCue::new(i as f64 * 2.0, format!("Repliikki {i}")))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_cover_every_line_in_order_with_delays() {
        let fx = fixture(FakeBackground::echoing());
        let track = cues(25);
        let started = tokio::time::Instant::now();

        let outcome = fx.batch.run(&track).await;

        assert_eq!(
            outcome,
            BatchOutcome::Finished {
                chunks: 3,
                translated: 25,
                fallback: 0
            }
        );
        let sent: Vec<String> = fx
            .fake
            .calls()
            .into_iter()
            .flat_map(|c| match c {
                Call::Batch(lines) => lines,
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        let expected: Vec<String> = track.iter().map(|c| c.text.clone()).collect();
        assert_eq!(sent, expected);
        let elapsed = started.elapsed();
        assert!(elapsed >= INTER_CHUNK_DELAY * 2, "two pauses between three chunks");
        assert!(elapsed < INTER_CHUNK_DELAY * 3, "no pause after the last chunk");

        for cue in &track {
            let hit = fx.cache.peek(&normalized_key(&cue.text)).unwrap();
            assert_eq!(hit.text(), cue.text.to_uppercase());
        }
        assert_eq!(fx.index.lock().len(), 25);
        assert!(!fx.gate.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn cached_and_duplicate_lines_are_not_resent() {
        let fx = fixture(FakeBackground::echoing());
        fx.cache.store_translation("repliikki 0", "cached");
        let mut track = cues(3);
        track.push(TrackCue::new(10.0, "REPLIIKKI 1"));

        fx.batch.run(&track).await;

        assert_eq!(
            fx.fake.calls(),
            vec![Call::Batch(vec!["Repliikki 1".into(), "Repliikki 2".into()])]
        );
        assert_eq!(fx.cache.peek("repliikki 0").unwrap().text(), "cached");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunk_gets_fallbacks() {
        let fx = fixture(FakeBackground::default());
        fx.fake.push_line_reply(Reply::Failed("quota".into()));

        let outcome = fx.batch.run(&cues(2)).await;

        assert_eq!(
            outcome,
            BatchOutcome::Finished {
                chunks: 1,
                translated: 0,
                fallback: 2
            }
        );
        assert!(fx.cache.peek("repliikki 0").unwrap().is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn same_track_runs_once() {
        let fx = fixture(FakeBackground::echoing());
        let track = cues(3);
        fx.batch.run(&track).await;
        assert_eq!(fx.batch.run(&track).await, BatchOutcome::AlreadyTranslated);
        assert_eq!(fx.fake.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn line_event_during_batch_waits_for_completion() {
        let fx = fixture(FakeBackground::echoing());
        let mut progress = fx.batch.subscribe_progress();
        let batch = Arc::clone(&fx.batch);
        let handle = tokio::spawn(async move { batch.run(&cues(15)).await });

        while !fx.gate.is_active() {
            tokio::task::yield_now().await;
        }
        // Let the first chunk go out.
        while fx.fake.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        fx.queue.push("Ihan uusi rivi");
        fx.queue.drain().await;
        assert!(
            fx.fake.calls().iter().all(|c| matches!(c, Call::Batch(_))),
            "queue must stay silent while the batch runs"
        );
        assert!(progress.borrow_and_update().is_some());

        handle.await.unwrap();

        let calls = fx.fake.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], Call::Line(vec!["Ihan uusi rivi".into()]));
        assert!(fx.batch.subscribe_progress().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_line_is_sent_once_but_indexed_at_every_start() {
        let fx = fixture(FakeBackground::echoing());
        let track = vec![
            TrackCue::new(0.0, "Kiitos paljon"),
            TrackCue::new(10.0, "Jotain muuta"),
            TrackCue::new(40.0, "Kiitos paljon"),
        ];

        fx.batch.run(&track).await;

        assert_eq!(
            fx.fake.calls(),
            vec![Call::Batch(vec!["Kiitos paljon".into(), "Jotain muuta".into()])]
        );
        let times: Vec<f64> = fx.index.lock().entries().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.0, 10.0, 40.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_context_falls_back_for_every_remaining_chunk() {
        let fx = fixture(FakeBackground::default());
        let track = cues(25);
        let first: Vec<String> = track[..10].iter().map(|c| c.text.to_uppercase()).collect();
        fx.fake.push_line_reply(Reply::Ok(first));
        fx.fake.push_line_reply(Reply::ContextInvalidated);

        let outcome = fx.batch.run(&track).await;

        assert_eq!(
            outcome,
            BatchOutcome::Finished {
                chunks: 2,
                translated: 10,
                fallback: 15
            }
        );
        assert_eq!(fx.fake.calls().len(), 2, "no chunk is sent after the context is lost");
        assert!(!fx.cache.peek("repliikki 0").unwrap().is_fallback());
        for cue in &track[10..] {
            let hit = fx.cache.peek(&normalized_key(&cue.text)).unwrap();
            assert_eq!(hit, CachedLine::Fallback(cue.text.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn language_switch_mid_run_leaves_tier_one_alone() {
        let store = Arc::new(SubtitleStore::open_in_memory().unwrap());
        let cache = Arc::new(TranslationCache::new(Some(Arc::clone(&store)), "EN-US"));
        cache.activate_movie("M");
        let messenger = Messenger::new(Arc::new(LanguageSwitch {
            cache: Arc::clone(&cache),
            to: "DE",
            reply: "Thanks a lot",
        }));
        let gate = BatchGate::default();
        let queue = TranslationQueue::new(Arc::clone(&cache), messenger.clone(), gate.clone());
        let batch = BatchPretranslator::new(
            Arc::clone(&cache),
            messenger,
            gate,
            queue,
            Arc::new(Mutex::new(TimestampIndex::new())),
        );

        batch.run(&[TrackCue::new(0.0, "Kiitos paljon")]).await;

        assert!(cache.peek("kiitos paljon").is_none());
        assert_eq!(store.get_subtitle("M", "DE", "kiitos paljon").unwrap(), None);
        assert_eq!(
            store.get_subtitle("M", "EN-US", "kiitos paljon").unwrap().as_deref(),
            Some("Thanks a lot")
        );
    }

    /// Records the highest number of provider calls in flight at once.
    #[derive(Default)]
    struct OverlapMeter {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
    }

    impl OverlapMeter {
        async fn call(&self, lines: &[String]) -> Reply<Vec<String>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Reply::Ok(lines.iter().map(|l| l.to_uppercase()).collect())
        }
    }

    #[async_trait]
    impl Background for OverlapMeter {
        async fn fetch_translation(&self, lines: &[String], _target: &str) -> Reply<Vec<String>> {
            self.call(lines).await
        }

        async fn fetch_batch_translation(
            &self,
            lines: &[String],
            _target: &str,
            _is_contextual: bool,
        ) -> Reply<Vec<String>> {
            self.call(lines).await
        }

        async fn translate_word_with_context(
            &self,
            _word: &str,
            _context_text: &str,
            _target: &str,
            _lang_name: &str,
        ) -> Reply<String> {
            Reply::Failed("not scripted".into())
        }

        async fn clear_word_cache(&self) -> Reply<()> {
            Reply::Ok(())
        }

        async fn open_options_page(&self) -> Reply<()> {
            Reply::Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_and_batch_calls_never_overlap_across_threads() {
        let meter = Arc::new(OverlapMeter::default());
        let cache = Arc::new(TranslationCache::new(None, "EN-US"));
        let gate = BatchGate::default();
        let messenger = Messenger::new(meter.clone());
        let queue = TranslationQueue::new(Arc::clone(&cache), messenger.clone(), gate.clone());
        let batch = Arc::new(BatchPretranslator::new(
            Arc::clone(&cache),
            messenger,
            gate,
            queue.clone(),
            Arc::new(Mutex::new(TimestampIndex::new())),
        ));

        for round in 0..40 {
            for i in 0..3 {
                queue.push(&format!("kierros {round} rivi {i}"));
            }
            let track: Vec<TrackCue> = (0..4)
                .map(|i| TrackCue::new(i as f64, format!("raita {round} repliikki {i}")))
                .collect();
            let q = queue.clone();
            let b = Arc::clone(&batch);
            let drain = tokio::spawn(async move { q.drain().await });
            let run = tokio::spawn(async move { b.run(&track).await });
            let (drained, ran) = tokio::join!(drain, run);
            drained.unwrap();
            ran.unwrap();
        }

        assert!(meter.total.load(Ordering::SeqCst) >= 80);
        assert_eq!(meter.peak.load(Ordering::SeqCst), 1);
    }
}
