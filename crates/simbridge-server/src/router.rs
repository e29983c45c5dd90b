//! Axum router construction for the data point API.
//!
//! Assembles the per-entry data point routes and the fixed routes into a
//! single [`Router`] with CORS and request tracing enabled.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::{any, get};
use simbridge_core::source::TelemetrySource;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{self, DATA_POINT_PREFIX};
use crate::state::AppState;

/// Build the complete Axum router for the data point server.
///
/// The router includes:
/// - `/simobject/<name>` -- one route per catalog entry, any method
/// - `GET /simobject` -- every data point as JSON
/// - `GET /health` -- connection status
/// - `GET /` -- plain-text index
///
/// Any other path answers `404` with `No path for "<path>"`.
pub fn build_router<S: TelemetrySource + 'static>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router: Router<Arc<AppState<S>>> = Router::new()
        .route("/", get(handlers::index::<S>))
        .route("/health", get(handlers::health::<S>))
        .route(DATA_POINT_PREFIX, get(handlers::all_data_points::<S>));

    for (handle, entry) in state.bridge.catalog().iter() {
        let path = format!("{DATA_POINT_PREFIX}/{}", entry.name());
        tracing::debug!(path = %path, request_id = %entry.request_id(), "Registered data point route");
        router = router.route(
            &path,
            any(move |State(state): State<Arc<AppState<S>>>| {
                handlers::data_point(state, handle)
            }),
        );
    }

    router
        .fallback(handlers::not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
