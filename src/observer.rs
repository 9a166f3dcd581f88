//! DOM observer and video lifecycle detection.
//! One subtree watcher over the page body feeds mutation records here. Each
//! delivery is classified into at most one `SubtitleChanged` and one
//! `VideoAppeared`; the latter is debounced because building a player emits a
//! burst of mutations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::{EventSender, PageEvent};

pub const VIDEO_DEBOUNCE: Duration = Duration::from_millis(1500);
pub const DEFAULT_SUBTITLE_MARKER: &str = "player-timedtext";
pub const AUGMENT_ATTEMPTS: u32 = 10;
pub const AUGMENT_INTERVAL: Duration = Duration::from_millis(500);

/// The part of a DOM node the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Lower-case tag name.
    pub tag: String,
    pub classes: Vec<String>,
    /// Whether a `<video>` element is among its descendants.
    pub contains_video: bool,
}

impl NodeInfo {
    pub fn element(tag: &str, classes: &[&str]) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            contains_video: false,
        }
    }

    pub fn with_video_inside(mut self) -> Self {
        self.contains_video = true;
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    fn is_or_contains_video(&self) -> bool {
        self.tag == "video" || self.contains_video
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeInfo,
    pub added_nodes: Vec<NodeInfo>,
}

pub struct DomObserver {
    marker: String,
    dual_sub_enabled: AtomicBool,
    video_guard_until: Mutex<Option<Instant>>,
    bus: EventSender,
}

impl DomObserver {
    pub fn new(marker: &str, dual_sub_enabled: bool, bus: EventSender) -> Self {
        Self {
            marker: marker.to_string(),
            dual_sub_enabled: AtomicBool::new(dual_sub_enabled),
            video_guard_until: Mutex::new(None),
            bus,
        }
    }

    pub fn set_dual_sub_enabled(&self, enabled: bool) {
        self.dual_sub_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Classify one delivery of mutation records.
    pub fn classify(&self, records: &[MutationRecord]) -> Vec<PageEvent> {
        let mut events = Vec::with_capacity(2);

        let subtitle = records.iter().any(|r| r.target.has_class(&self.marker));
        if subtitle {
            if self.dual_sub_enabled.load(Ordering::SeqCst) {
                events.push(PageEvent::SubtitleChanged);
            } else {
                debug!("subtitle mutation ignored, dual subtitles off");
            }
        }

        let video = records
            .iter()
            .flat_map(|r| r.added_nodes.iter())
            .any(NodeInfo::is_or_contains_video);
        if video && self.arm_video_guard() {
            events.push(PageEvent::VideoAppeared);
        }
        events
    }

    /// Classify and publish. Returns the number of events sent.
    pub fn on_mutations(&self, records: &[MutationRecord]) -> usize {
        self.classify(records)
            .into_iter()
            .filter(|&event| self.bus.send(event))
            .count()
    }

    /// True if the cool-down had expired and is now re-armed.
    fn arm_video_guard(&self) -> bool {
        let now = Instant::now();
        let mut guard = self.video_guard_until.lock();
        if matches!(*guard, Some(until) if now < until) {
            debug!("video appearance within cool-down, ignored");
            return false;
        }
        *guard = Some(now + VIDEO_DEBOUNCE);
        info!("video element appeared");
        true
    }
}

/// Injects the player controls (toggles, speed, skip buttons).
pub trait ControlSurface: Send + Sync {
    /// False while the player container is not on the page yet.
    fn try_inject(&self) -> bool;
}

/// Retry control injection at a fixed interval; gives up with a warning.
pub async fn augment_player(
    controls: &dyn ControlSurface,
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    for attempt in 1..=attempts {
        if controls.try_inject() {
            info!(attempt, "player controls injected");
            return true;
        }
        if attempt == attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return false,
        }
    }
    warn!(attempts, "player container never appeared, controls not injected");
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::scheduler::event_bus;

    fn subtitle_record() -> MutationRecord {
        MutationRecord {
            target: NodeInfo::element("div", &[DEFAULT_SUBTITLE_MARKER]),
            added_nodes: vec![NodeInfo::element("span", &[])],
        }
    }

    fn video_record() -> MutationRecord {
        MutationRecord {
            target: NodeInfo::element("div", &["player"]),
            added_nodes: vec![NodeInfo::element("div", &["container"]).with_video_inside()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifies_subtitle_and_video_mutations() {
        let (tx, _rx) = event_bus();
        let observer = DomObserver::new(DEFAULT_SUBTITLE_MARKER, true, tx);

        let events = observer.classify(&[subtitle_record(), subtitle_record(), video_record()]);
        assert_eq!(events, vec![PageEvent::SubtitleChanged, PageEvent::VideoAppeared]);

        let unrelated = MutationRecord {
            target: NodeInfo::element("div", &["menu"]),
            added_nodes: vec![NodeInfo::element("button", &[])],
        };
        assert!(observer.classify(&[unrelated]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn video_appearance_is_debounced() {
        let (tx, mut rx) = event_bus();
        let observer = DomObserver::new(DEFAULT_SUBTITLE_MARKER, true, tx);

        assert_eq!(observer.on_mutations(&[video_record()]), 1);
        assert_eq!(observer.on_mutations(&[video_record()]), 0);
        tokio::time::advance(VIDEO_DEBOUNCE).await;
        assert_eq!(observer.on_mutations(&[video_record()]), 1);

        assert_eq!(rx.recv().await, Some(PageEvent::VideoAppeared));
        assert_eq!(rx.recv().await, Some(PageEvent::VideoAppeared));
    }

    #[tokio::test(start_paused = true)]
    async fn subtitles_ignored_when_disabled() {
        let (tx, _rx) = event_bus();
        let observer = DomObserver::new(DEFAULT_SUBTITLE_MARKER, false, tx);
        assert!(observer.classify(&[subtitle_record()]).is_empty());
        observer.set_dual_sub_enabled(true);
        assert_eq!(observer.classify(&[subtitle_record()]), vec![PageEvent::SubtitleChanged]);
    }

    struct Flaky {
        calls: AtomicU32,
        ready_on: u32,
    }

    impl ControlSurface for Flaky {
        fn try_inject(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_on
        }
    }

    #[tokio::test(start_paused = true)]
    async fn augmentation_retries_then_succeeds() {
        let controls = Flaky {
            calls: AtomicU32::new(0),
            ready_on: 3,
        };
        let ok = augment_player(&controls, AUGMENT_ATTEMPTS, AUGMENT_INTERVAL, &CancellationToken::new()).await;
        assert!(ok);
        assert_eq!(controls.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn augmentation_gives_up_after_bounded_attempts() {
        let controls = Flaky {
            calls: AtomicU32::new(0),
            ready_on: u32::MAX,
        };
        let ok = augment_player(&controls, 4, AUGMENT_INTERVAL, &CancellationToken::new()).await;
        assert!(!ok);
        assert_eq!(controls.calls.load(Ordering::SeqCst), 4);
    }
}
