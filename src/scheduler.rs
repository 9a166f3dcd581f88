//! Typed page-event bus.
//! The DOM observer publishes `SubtitleChanged` / `VideoAppeared` on an
//! unbounded channel; a single dispatch loop hands each event to its handler.
//! Handlers must return quickly: long waits are spawned, never awaited inline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageEvent {
    SubtitleChanged,
    VideoAppeared,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_subtitle_changed(&self);
    async fn on_video_appeared(&self);
}

/// Sending half; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PageEvent>,
}

impl EventSender {
    /// Never blocks. Returns false once the dispatch loop is gone.
    pub fn send(&self, event: PageEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(event = ?e.0, "event bus closed, dropping event");
                false
            }
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<PageEvent>;

pub fn event_bus() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Dispatch events until the channel closes or `cancel` fires.
pub async fn run_event_loop(mut rx: EventReceiver, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
    info!("event loop started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!(?event, "dispatching page event");
        match event {
            PageEvent::SubtitleChanged => handler.on_subtitle_changed().await,
            PageEvent::VideoAppeared => handler.on_video_appeared().await,
        }
    }
    info!("event loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        subtitles: AtomicUsize,
        videos: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn on_subtitle_changed(&self) {
            self.subtitles.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_video_appeared(&self) {
            self.videos.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn events_reach_their_handlers_until_channel_closes() {
        let (tx, rx) = event_bus();
        let handler = Arc::new(Counting::default());
        tx.send(PageEvent::SubtitleChanged);
        tx.send(PageEvent::VideoAppeared);
        tx.send(PageEvent::SubtitleChanged);
        drop(tx);

        run_event_loop(rx, handler.clone(), CancellationToken::new()).await;

        assert_eq!(handler.subtitles.load(Ordering::SeqCst), 2);
        assert_eq!(handler.videos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (tx, rx) = event_bus();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_event_loop(rx, Arc::new(Counting::default()), cancel).await;
        assert!(!tx.send(PageEvent::VideoAppeared), "receiver is gone");
    }
}
