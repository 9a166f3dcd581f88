//! dualsub: dual-subtitle core for video-playback pages.
//! Observes the page for subtitle and video changes, renders a translated
//! second line next to the original, batches and caches line translations in
//! two tiers, and runs a popup dictionary over the words of each line.

pub mod cancellation;
pub mod config;
pub mod history;
pub mod lookup;
pub mod observer;
pub mod render;
pub mod scheduler;
pub mod session;
pub mod state_machine;
pub mod timeline;
pub mod translate;

use tracing::info;

pub use config::{Settings, SettingsStore};
pub use session::{Collaborators, DualSubSession};

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `DUALSUB_LOG_JSON=1` switches to JSON lines. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dualsub=debug"));
    let json = std::env::var("DUALSUB_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        info!(json, "dualsub tracing initialized");
    }
}
