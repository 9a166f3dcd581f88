//! Timestamp index of subtitle occurrences, skip navigation and auto-pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// Entries closer than this are the same occurrence.
pub const DEDUP_TOLERANCE_SECS: f64 = 0.5;
pub const MAX_ENTRIES: usize = 1000;
/// Skip-forward ignores entries this close after the current time.
pub const FORWARD_TOLERANCE_SECS: f64 = 0.5;
/// Skip-backward targets entries at least this far behind the current time.
pub const BACKWARD_MIN_GAP_SECS: f64 = 1.0;
/// Jump used when no entry qualifies.
pub const FALLBACK_SKIP_SECS: f64 = 5.0;
/// How long auto-pause stays quiet after a programmatic seek.
pub const SEEK_SUPPRESSION: Duration = Duration::from_secs(1);

/// The page's video element.
pub trait Player: Send + Sync {
    fn current_time(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn seek(&self, time: f64);
    fn pause(&self);
    fn is_paused(&self) -> bool;
    fn set_playback_rate(&self, rate: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampEntry {
    pub time: f64,
    pub text: String,
    #[serde(skip)]
    seq: u64,
}

/// Time-ordered subtitle occurrences, deduplicated within
/// [`DEDUP_TOLERANCE_SECS`] and capped at [`MAX_ENTRIES`] (oldest insert evicted).
#[derive(Debug, Default)]
pub struct TimestampIndex {
    entries: Vec<TimestampEntry>,
    next_seq: u64,
    sorted: bool,
}

impl TimestampIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TimestampEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sorted = true;
    }

    fn has_near(&self, time: f64) -> bool {
        self.entries
            .iter()
            .any(|e| (e.time - time).abs() < DEDUP_TOLERANCE_SECS)
    }

    fn entry(&mut self, time: f64, text: &str) -> TimestampEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        TimestampEntry {
            time,
            text: text.to_string(),
            seq,
        }
    }

    /// Insert keeping time order. Returns false for a duplicate occurrence.
    pub fn record(&mut self, time: f64, text: &str) -> bool {
        if !time.is_finite() || self.has_near(time) {
            return false;
        }
        let entry = self.entry(time, text);
        if self.sorted {
            let pos = self.entries.partition_point(|e| e.time < time);
            self.entries.insert(pos, entry);
        } else {
            self.entries.push(entry);
        }
        self.evict();
        true
    }

    /// Append without ordering; bulk seeding ends with [`sort`](Self::sort).
    pub fn seed(&mut self, time: f64, text: &str) -> bool {
        if !time.is_finite() || self.has_near(time) {
            return false;
        }
        let entry = self.entry(time, text);
        self.entries.push(entry);
        self.sorted = false;
        self.evict();
        true
    }

    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.sorted = true;
    }

    fn evict(&mut self) {
        while self.entries.len() > MAX_ENTRIES {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.seq)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    self.entries.remove(i);
                }
                None => break,
            }
        }
    }

    /// Earliest entry strictly after `time`.
    pub fn next_after(&self, time: f64) -> Option<f64> {
        self.entries
            .iter()
            .map(|e| e.time)
            .filter(|&t| t > time)
            .min_by(f64::total_cmp)
    }

    /// Latest entry at or before `time`.
    pub fn last_at_or_before(&self, time: f64) -> Option<f64> {
        self.entries
            .iter()
            .map(|e| e.time)
            .filter(|&t| t <= time)
            .max_by(f64::total_cmp)
    }
}

/// Result of evaluating auto-pause for a freshly resolved line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPause {
    Disabled,
    /// A programmatic seek happened moments ago.
    Suppressed,
    /// Same line as last time, or the video is already paused.
    Unchanged,
    Paused,
}

/// Skip navigation and auto-pause over a shared [`TimestampIndex`].
pub struct Navigator {
    index: Arc<Mutex<TimestampIndex>>,
    auto_pause: AtomicBool,
    suppress_until: Mutex<Option<Instant>>,
    last_line: Mutex<Option<String>>,
}

impl Navigator {
    pub fn new(index: Arc<Mutex<TimestampIndex>>, auto_pause: bool) -> Self {
        Self {
            index,
            auto_pause: AtomicBool::new(auto_pause),
            suppress_until: Mutex::new(None),
            last_line: Mutex::new(None),
        }
    }

    pub fn index(&self) -> &Arc<Mutex<TimestampIndex>> {
        &self.index
    }

    pub fn set_auto_pause(&self, enabled: bool) {
        self.auto_pause.store(enabled, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(*self.suppress_until.lock(), Some(until) if Instant::now() < until)
    }

    fn suppress(&self) {
        *self.suppress_until.lock() = Some(Instant::now() + SEEK_SUPPRESSION);
    }

    /// Seek to the next subtitle after the current one, or 5 s ahead.
    pub fn skip_forward(&self, player: &dyn Player) -> f64 {
        let now = player.current_time();
        let next = self.index.lock().next_after(now + FORWARD_TOLERANCE_SECS);
        let mut target = next.unwrap_or(now + FALLBACK_SKIP_SECS);
        if let Some(duration) = player.duration() {
            target = target.min(duration);
        }
        self.suppress();
        player.seek(target);
        info!(from = now, to = target, indexed = next.is_some(), "skip forward");
        target
    }

    /// Seek to the previous subtitle at least 1 s back, or 5 s back (not below 0).
    pub fn skip_backward(&self, player: &dyn Player) -> f64 {
        let now = player.current_time();
        let prev = self.index.lock().last_at_or_before(now - BACKWARD_MIN_GAP_SECS);
        let target = prev.unwrap_or(now - FALLBACK_SKIP_SECS).max(0.0);
        self.suppress();
        player.seek(target);
        info!(from = now, to = target, indexed = prev.is_some(), "skip backward");
        target
    }

    /// Record a resolved line at the player's current time and pause if it is a
    /// new line and auto-pause is on.
    pub fn on_line_resolved(&self, player: &dyn Player, text: &str) -> AutoPause {
        let time = player.current_time();
        self.index.lock().record(time, text);

        let changed = {
            let mut last = self.last_line.lock();
            let changed = last.as_deref() != Some(text);
            *last = Some(text.to_string());
            changed
        };

        if !self.auto_pause.load(Ordering::SeqCst) {
            return AutoPause::Disabled;
        }
        if self.is_suppressed() {
            debug!(time, "auto-pause suppressed after seek");
            return AutoPause::Suppressed;
        }
        if !changed || player.is_paused() {
            return AutoPause::Unchanged;
        }
        player.pause();
        debug!(time, "auto-paused on new line");
        AutoPause::Paused
    }

    /// Forget per-title state when a new video appears.
    pub fn reset(&self) {
        self.index.lock().clear();
        *self.last_line.lock() = None;
        *self.suppress_until.lock() = None;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::Player;

    #[derive(Debug, Default)]
    pub struct FakePlayer {
        pub time: Mutex<f64>,
        pub duration: Option<f64>,
        pub paused: Mutex<bool>,
        pub rate: Mutex<f64>,
        pub seeks: Mutex<Vec<f64>>,
    }

    impl FakePlayer {
        pub fn at(time: f64) -> Self {
            Self {
                time: Mutex::new(time),
                ..Self::default()
            }
        }
    }

    impl Player for FakePlayer {
        fn current_time(&self) -> f64 {
            *self.time.lock()
        }
        fn duration(&self) -> Option<f64> {
            self.duration
        }
        fn seek(&self, time: f64) {
            *self.time.lock() = time;
            self.seeks.lock().push(time);
        }
        fn pause(&self) {
            *self.paused.lock() = true;
        }
        fn is_paused(&self) -> bool {
            *self.paused.lock()
        }
        fn set_playback_rate(&self, rate: f64) {
            *self.rate.lock() = rate;
        }
    }
}
