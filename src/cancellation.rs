//! Generation tokens for superseded work.
//! A newer subtitle supersedes the previous render's pending wait; a newer
//! word click supersedes the previous lookup. Stale tasks must not write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Each `advance` cancels everything issued before it and hands out a fresh guard.
#[derive(Default)]
pub struct TaskGeneration {
    live: Mutex<CancellationToken>,
    counter: Arc<AtomicU64>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self) -> GenerationGuard {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.live.lock(), token.clone());
        previous.cancel();
        GenerationGuard {
            issued: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
            counter: Arc::clone(&self.counter),
            token,
        }
    }

    /// Invalidate the live guard without issuing a new one.
    pub fn cancel_all(&self) {
        self.live.lock().cancel();
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Held by a task; checked before it writes results.
#[derive(Clone, Debug)]
pub struct GenerationGuard {
    counter: Arc<AtomicU64>,
    issued: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    /// Not cancelled and nothing newer was issued.
    pub fn should_continue(&self) -> bool {
        !self.token.is_cancelled() && self.counter.load(Ordering::SeqCst) == self.issued
    }

    /// Fires when the guard is superseded or cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
