//! Connection status shared between the dispatch pump and the fetch path.
//!
//! The handshake callback flips `connected` exactly once. A `Quit` from the
//! source flips `disconnected` exactly once. Fetches are refused before the
//! first flip and after the second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::source::SourceError;

/// Errors raised while waiting for the source handshake.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The handshake did not complete in time.
    #[error("source did not complete the handshake within {waited_ms}ms")]
    Timeout {
        /// How long the startup sequence waited.
        waited_ms: u64,
    },

    /// The source quit before the handshake completed.
    #[error("source quit before the handshake completed")]
    Quit,

    /// Pumping the source failed.
    #[error("source error during handshake: {0}")]
    Source(#[from] SourceError),
}

/// Process-wide connection flags.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: AtomicBool,
    disconnected: AtomicBool,
    application: Mutex<Option<String>>,
}

impl ConnectionState {
    /// Create a state that is neither connected nor disconnected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the handshake. Returns `true` only for the first call.
    pub fn mark_connected(&self, application: &str) -> bool {
        let first = !self.connected.swap(true, Ordering::AcqRel);
        if first {
            *self
                .application
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(application.to_owned());
        }
        first
    }

    /// Record that the source quit. Returns `true` only for the first call.
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Whether the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the source has quit.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Connected and not yet disconnected.
    pub fn is_live(&self) -> bool {
        self.is_connected() && !self.is_disconnected()
    }

    /// Name the source reported in its handshake.
    pub fn application(&self) -> Option<String> {
        self.application
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
