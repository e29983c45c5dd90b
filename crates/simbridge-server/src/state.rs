//! Shared application state for the data point API.
//!
//! [`AppState`] holds the [`Bridge`] every handler fetches through, plus
//! the name the server announces on its index page.

use std::sync::Arc;
use std::time::Instant;

use simbridge_core::bridge::Bridge;

/// Shared state passed to all Axum handlers via [`axum::extract::State`].
#[derive(Debug)]
pub struct AppState<S> {
    /// Blocking fetch over the data point catalog.
    pub bridge: Arc<Bridge<S>>,
    /// Name shown on the index page and in health reports.
    pub server_name: String,
    started_at: Instant,
}

impl<S> AppState<S> {
    /// Create state around a bridge that is ready to fetch.
    pub fn new(bridge: Arc<Bridge<S>>, server_name: impl Into<String>) -> Self {
        Self {
            bridge,
            server_name: server_name.into(),
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
