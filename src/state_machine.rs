//! State machines for the popup dictionary and for rendered subtitle lines.
//! Tooltip: Idle → Loading → Resolved(source) | Error, with Resolved/Error →
//! Loading for "ask AI" and "retry", and any state → Idle on close.
//! Rendered line: Pending → Resolved | TimedOut.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::translate::WordSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TooltipStatus {
    Idle,
    Loading,
    Resolved,
    Error,
}

impl std::fmt::Display for TooltipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TooltipStatus::Idle => write!(f, "Idle"),
            TooltipStatus::Loading => write!(f, "Loading"),
            TooltipStatus::Resolved => write!(f, "Resolved"),
            TooltipStatus::Error => write!(f, "Error"),
        }
    }
}

impl TooltipStatus {
    pub fn can_transition_to(self, next: TooltipStatus) -> bool {
        matches!(
            (self, next),
            (TooltipStatus::Idle, TooltipStatus::Loading)
                | (TooltipStatus::Loading, TooltipStatus::Resolved)
                | (TooltipStatus::Loading, TooltipStatus::Error)
                | (TooltipStatus::Resolved, TooltipStatus::Loading) // ask AI
                | (TooltipStatus::Error, TooltipStatus::Loading) // retry
                | (_, TooltipStatus::Idle)
        )
    }
}

/// Identifies the clicked word token: rendered line id + token position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WordAnchor {
    pub line_id: String,
    pub token_index: usize,
}

/// Follow-up actions the tooltip offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TooltipAction {
    /// Re-query with subtitle context and overwrite the cached entry.
    AskAi,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TooltipState {
    pub status: TooltipStatus,
    pub word: String,
    pub anchor: WordAnchor,
    /// Full subtitle line the word was clicked in.
    pub line: String,
    pub translation: Option<String>,
    pub source: Option<WordSource>,
    pub error: Option<String>,
}

impl TooltipState {
    pub fn actions(&self) -> Vec<TooltipAction> {
        match (self.status, self.source) {
            (TooltipStatus::Resolved, Some(WordSource::Cache | WordSource::Dictionary)) => {
                vec![TooltipAction::AskAi]
            }
            (TooltipStatus::Error, _) => vec![TooltipAction::Retry],
            _ => Vec::new(),
        }
    }
}

/// The single live tooltip, published on a watch channel for the view layer.
pub struct TooltipMachine {
    state: RwLock<Option<TooltipState>>,
    state_tx: watch::Sender<Option<TooltipState>>,
}

impl Default for TooltipMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TooltipMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(None);
        Self {
            state: RwLock::new(None),
            state_tx,
        }
    }

    pub fn current(&self) -> Option<TooltipState> {
        self.state.read().clone()
    }

    pub fn status(&self) -> TooltipStatus {
        self.state
            .read()
            .as_ref()
            .map_or(TooltipStatus::Idle, |s| s.status)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TooltipState>> {
        self.state_tx.subscribe()
    }

    pub fn is_open_at(&self, anchor: &WordAnchor) -> bool {
        self.state.read().as_ref().is_some_and(|s| &s.anchor == anchor)
    }

    /// Replace whatever is open with a loading tooltip for `word`.
    pub fn open(&self, word: &str, anchor: WordAnchor, line: &str) {
        let next = TooltipState {
            status: TooltipStatus::Loading,
            word: word.to_string(),
            anchor,
            line: line.to_string(),
            translation: None,
            source: None,
            error: None,
        };
        let mut state = self.state.write();
        *state = Some(next.clone());
        self.state_tx.send_replace(Some(next));
        debug!(word, "tooltip opened");
    }

    pub fn resolve(&self, translation: &str, source: WordSource) -> Result<TooltipStatus, String> {
        self.apply(TooltipStatus::Resolved, |s| {
            s.translation = Some(translation.to_string());
            s.source = Some(source);
            s.error = None;
        })
    }

    pub fn fail(&self, error: &str) -> Result<TooltipStatus, String> {
        self.apply(TooltipStatus::Error, |s| {
            s.error = Some(error.to_string());
        })
    }

    /// Back to Loading for "ask AI" or "retry". The previous translation stays
    /// visible until the new one arrives.
    pub fn reload(&self) -> Result<TooltipStatus, String> {
        self.apply(TooltipStatus::Loading, |s| s.error = None)
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        if state.take().is_some() {
            self.state_tx.send_replace(None);
            debug!("tooltip closed");
        }
    }

    fn apply(&self, next: TooltipStatus, update: impl FnOnce(&mut TooltipState)) -> Result<TooltipStatus, String> {
        let mut state = self.state.write();
        let Some(current) = state.as_mut() else {
            return Err(format!("no tooltip open for transition to {next}"));
        };
        if !current.status.can_transition_to(next) {
            let msg = format!("invalid tooltip transition: {} -> {}", current.status, next);
            warn!("{}", msg);
            return Err(msg);
        }
        current.status = next;
        update(current);
        self.state_tx.send_replace(Some(current.clone()));
        Ok(next)
    }
}

/// Lifecycle of one rendered translation line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LineState {
    Pending,
    Resolved,
    /// Fell back to the original text after the wait expired.
    TimedOut,
}

impl LineState {
    pub fn can_transition_to(self, next: LineState) -> bool {
        matches!(
            (self, next),
            (LineState::Pending, LineState::Resolved) | (LineState::Pending, LineState::TimedOut)
        )
    }
}
