//! Shared application state for the `ZVault` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use zvault_core::Core;

/// Shared application state passed to all HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The vault node served by this process.
    pub core: Core,
}

impl AppState {
    #[must_use]
    pub fn new(core: Core) -> Self {
        Self { core }
    }
}
