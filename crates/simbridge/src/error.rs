//! Error types for the `SimBridge` binary.
//!
//! [`AppError`] is the top-level error type that wraps all possible
//! failure modes during startup and serving.

/// Top-level error for the `SimBridge` binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: simbridge_core::config::ConfigError,
    },

    /// The telemetry source could not be opened or rejected a definition.
    #[error("source error: {source}")]
    Source {
        /// The underlying source error.
        #[from]
        source: simbridge_core::source::SourceError,
    },

    /// The source handshake did not complete.
    #[error("connect error: {source}")]
    Connect {
        /// The underlying handshake error.
        #[from]
        source: simbridge_core::connection::ConnectError,
    },

    /// The data point catalog is invalid.
    #[error("catalog error: {source}")]
    Catalog {
        /// The underlying catalog error.
        #[from]
        source: simbridge_core::catalog::CatalogError,
    },

    /// The HTTP server failed to bind or serve.
    #[error("server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: simbridge_server::ServerError,
    },

    /// The dispatch thread could not be started.
    #[error("dispatch thread error: {source}")]
    Dispatch {
        /// The underlying spawn error.
        #[from]
        source: std::io::Error,
    },

    /// A blocking startup task failed to complete.
    #[error("startup task error: {message}")]
    Task {
        /// Description of the task failure.
        message: String,
    },
}
