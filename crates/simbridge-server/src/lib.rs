//! HTTP data point API for `SimBridge`.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **`/simobject/<name>`** for each catalog entry: one blocking fetch per
//!   request, answered as `text/plain`
//! - **`/simobject`** with every data point's current value as JSON
//! - **`/health`** with the source connection status
//! - **`/`** with a plain-text index of the data point paths
//!
//! # Architecture
//!
//! Data point routes are registered once at startup from the immutable
//! catalog, each bound to its entry's handle. Fetches block on the source,
//! so handlers run them on Tokio's blocking pool via
//! [`tokio::task::spawn_blocking`].

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
