//! Integration tests for the data point API.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server, against a bridge backed by the in-process
//! simulated source. One test serves over a real socket to exercise
//! graceful shutdown.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use simbridge_core::bridge::{Bridge, FetchOptions};
use simbridge_core::catalog::Catalog;
use simbridge_core::config::{DataPointConfig, DispatchMode, THROTTLE_FIELD};
use simbridge_core::dispatch::Dispatcher;
use simbridge_core::ids::{DefinitionId, RequestId};
use simbridge_core::simulated::{SimulatedSim, SimulatedSource};
use simbridge_core::source::DataKind;
use simbridge_server::router::build_router;
use simbridge_server::server::{ServerConfig, bind, serve};
use simbridge_server::state::AppState;
use tower::ServiceExt;

fn data_points() -> Vec<DataPointConfig> {
    vec![
        DataPointConfig {
            name: String::from("throttle"),
            request_id: RequestId(1),
            definition_id: DefinitionId(1),
            field: String::from(THROTTLE_FIELD),
            unit: String::from("percent"),
            kind: DataKind::Float64,
        },
        DataPointConfig {
            name: String::from("gear_down"),
            request_id: RequestId(2),
            definition_id: DefinitionId(2),
            field: String::from("GEAR HANDLE POSITION"),
            unit: String::from("bool"),
            kind: DataKind::Bool,
        },
    ]
}

fn make_sim() -> Arc<SimulatedSim> {
    let sim = Arc::new(SimulatedSim::new());
    sim.set_value(THROTTLE_FIELD, 42.5);
    sim.set_value("GEAR HANDLE POSITION", 1.0);
    sim
}

fn make_state(sim: &Arc<SimulatedSim>, connect: bool) -> Arc<AppState<SimulatedSource>> {
    let source = SimulatedSource::open("api-tests", Arc::clone(sim)).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(source));
    if connect {
        dispatcher
            .await_connection(Duration::from_secs(1), Duration::from_millis(1))
            .unwrap();
    }
    let options = FetchOptions {
        timeout: Duration::from_millis(100),
        mode: DispatchMode::Inline,
        pump_interval: Duration::from_millis(1),
    };
    let catalog = Arc::new(Catalog::from_config(&data_points()).unwrap());
    let bridge = Arc::new(Bridge::new(catalog, dispatcher, options));
    bridge.register_definitions().unwrap();
    Arc::new(AppState::new(bridge, "SimConnect Bridge"))
}

async fn body_to_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_to_json(body: Body) -> Value {
    serde_json::from_str(&body_to_string(body).await).unwrap()
}

#[tokio::test]
async fn test_throttle_served_as_text() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(Request::get("/simobject/throttle").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(content_type.starts_with("text/plain"));
    assert_eq!(body_to_string(response.into_body()).await, "42.500000");
}

#[tokio::test]
async fn test_any_method_and_query_are_accepted() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(
            Request::post("/simobject/gear_down?verbose=1")
                .header("x-ignored", "yes")
                .body(Body::from("ignored"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_string(response.into_body()).await, "true");
}

#[tokio::test]
async fn test_each_request_fetches_fresh_value() {
    let sim = make_sim();
    let state = make_state(&sim, true);

    for value in [10.0, 20.25, 30.5] {
        sim.set_value(THROTTLE_FIELD, value);
        let response = build_router(Arc::clone(&state))
            .oneshot(Request::get("/simobject/throttle").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_to_string(response.into_body()).await,
            format!("{value:.6}")
        );
    }
    assert_eq!(sim.requests_seen(), 3);
}

#[tokio::test]
async fn test_unknown_path_is_404_text() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(Request::get("/simobject/mixture").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_to_string(response.into_body()).await,
        "No path for \"/simobject/mixture\""
    );
}

#[tokio::test]
async fn test_silent_source_is_gateway_timeout() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));
    sim.set_muted(true);

    let response = app
        .oneshot(Request::get("/simobject/throttle").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], 504);
    assert!(json["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_not_connected_is_service_unavailable() {
    let sim = make_sim();
    sim.set_handshake_delay(Duration::from_secs(60));
    let app = build_router(make_state(&sim, false));

    let response = app
        .oneshot(Request::get("/simobject/throttle").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(sim.requests_seen(), 0);
}

#[tokio::test]
async fn test_quit_is_service_unavailable() {
    let sim = make_sim();
    let state = make_state(&sim, true);
    sim.set_muted(true);
    sim.quit();

    let response = build_router(Arc::clone(&state))
        .oneshot(Request::get("/simobject/throttle").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = build_router(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_to_json(health.into_body()).await;
    assert_eq!(json["status"], "unavailable");
    assert_eq!(json["disconnected"], true);
}

#[tokio::test]
async fn test_all_data_points_as_json() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(Request::get("/simobject").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["count"], 2);
    assert_eq!(json["values"]["throttle"], "42.500000");
    assert_eq!(json["values"]["gear_down"], "true");
    assert!(json["errors"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_reports_connection() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connected"], true);
    assert_eq!(json["app_name"], "SimBridge Simulator");
    assert_eq!(json["data_points"], 2);
    assert_eq!(json["pending_fetches"], 0);
}

#[tokio::test]
async fn test_index_lists_data_points() {
    let sim = make_sim();
    let app = build_router(make_state(&sim, true));

    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_string(response.into_body()).await;
    assert!(body.starts_with("SimConnect Bridge"));
    assert!(body.contains("/simobject/throttle\n"));
    assert!(body.contains("/simobject/gear_down\n"));
}

#[tokio::test]
async fn test_serves_over_tcp_until_shutdown() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let sim = make_sim();
    let listener = bind(&ServerConfig {
        host: String::from("127.0.0.1"),
        port: 0,
    })
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, make_state(&sim, true), async move {
        let _ = stop_rx.await;
    }));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /simobject/throttle HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    assert!(raw.starts_with("HTTP/1.1 200"));
    assert!(raw.ends_with("42.500000"));

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
