//! Endpoint handlers for the data point API.
//!
//! Every fetch blocks until the source answers or the deadline passes, so
//! handlers hand it to [`tokio::task::spawn_blocking`] and await the result.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | any | `/simobject/<name>` | Current value of one data point (`text/plain`) |
//! | `GET` | `/simobject` | Current value of every data point (JSON) |
//! | `GET` | `/health` | Source connection status (JSON) |
//! | `GET` | `/` | Plain-text index of data point paths |

use std::fmt::Write as _;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use simbridge_core::catalog::EntryHandle;
use simbridge_core::source::TelemetrySource;

use crate::error::ApiError;
use crate::state::AppState;

/// Path prefix under which each data point is exposed.
pub const DATA_POINT_PREFIX: &str = "/simobject";

// ---------------------------------------------------------------------------
// /simobject/<name> -- one data point
// ---------------------------------------------------------------------------

/// Fetch one data point and answer with its formatted value.
///
/// Method, headers, and query string are ignored.
///
/// # Errors
///
/// Returns the [`ApiError::Fetch`] describing why the fetch failed, or
/// [`ApiError::Internal`] if the blocking task could not complete.
pub async fn data_point<S: TelemetrySource + 'static>(
    state: Arc<AppState<S>>,
    handle: EntryHandle,
) -> Result<String, ApiError> {
    let bridge = Arc::clone(&state.bridge);
    let value = tokio::task::spawn_blocking(move || bridge.fetch(handle))
        .await
        .map_err(|e| ApiError::Internal(format!("fetch task failed: {e}")))??;
    Ok(value)
}

// ---------------------------------------------------------------------------
// GET /simobject -- every data point
// ---------------------------------------------------------------------------

/// Fetch every data point in catalog order.
///
/// Entries that fail are reported under `errors` instead of `values`.
///
/// # Errors
///
/// Returns [`ApiError::Internal`] if the blocking task could not complete.
pub async fn all_data_points<S: TelemetrySource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<impl IntoResponse, ApiError> {
    let bridge = Arc::clone(&state.bridge);
    let results = tokio::task::spawn_blocking(move || bridge.fetch_all())
        .await
        .map_err(|e| ApiError::Internal(format!("fetch task failed: {e}")))?;

    let mut values = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for (name, result) in results {
        match result {
            Ok(value) => {
                values.insert(name, serde_json::Value::String(value));
            }
            Err(e) => {
                errors.insert(name, serde_json::Value::String(e.to_string()));
            }
        }
    }

    Ok(Json(serde_json::json!({
        "count": values.len(),
        "values": values,
        "errors": errors,
    })))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Report the source connection and dispatch counters.
pub async fn health<S: TelemetrySource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    let dispatcher = state.bridge.dispatcher();
    let connection = dispatcher.connection();
    let status = if connection.is_live() { "ok" } else { "unavailable" };

    Json(serde_json::json!({
        "status": status,
        "server": state.server_name,
        "connected": connection.is_connected(),
        "disconnected": connection.is_disconnected(),
        "app_name": connection.application(),
        "data_points": state.bridge.catalog().len(),
        "pending_fetches": dispatcher.registry().len(),
        "uptime_secs": state.uptime_secs(),
        "stats": dispatcher.stats(),
    }))
}

// ---------------------------------------------------------------------------
// GET / -- plain-text index
// ---------------------------------------------------------------------------

/// List the paths this server answers on.
pub async fn index<S: TelemetrySource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> String {
    let mut body = format!("{}\n\n", state.server_name);
    for (_, entry) in state.bridge.catalog().iter() {
        let _ = writeln!(body, "{DATA_POINT_PREFIX}/{}", entry.name());
    }
    let _ = writeln!(body, "{DATA_POINT_PREFIX}");
    let _ = writeln!(body, "/health");
    body
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// Answer paths no route matched.
pub async fn not_found(uri: Uri) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, format!("No path for \"{}\"", uri.path()))
}
