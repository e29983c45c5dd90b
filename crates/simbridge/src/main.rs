//! `SimBridge` binary.
//!
//! Connects to the flight simulator, registers the configured data
//! points, and serves each of them over HTTP until interrupted.
//!
//! # Usage
//!
//! ```text
//! simbridge [config-path]
//! ```
//!
//! The config path defaults to `simbridge.yaml`. When that default file
//! is absent the built-in defaults are used.
//!
//! # Startup Sequence
//!
//! 1. Load configuration
//! 2. Initialize structured logging (tracing)
//! 3. Build the data point catalog
//! 4. Open the telemetry source
//! 5. Wait for the source handshake
//! 6. Register data definitions with the source
//! 7. Start the dispatch thread (background mode only)
//! 8. Serve HTTP until Ctrl-C
//! 9. Stop the dispatch thread and close the source

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use simbridge_core::bridge::{Bridge, FetchOptions};
use simbridge_core::catalog::Catalog;
use simbridge_core::config::{BridgeConfig, DispatchMode, LoggingConfig};
use simbridge_core::dispatch::Dispatcher;
use simbridge_core::simulated::{SimulatedSim, SimulatedSource};
use simbridge_server::{AppState, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Config file read when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "simbridge.yaml";

/// Application entry point for `SimBridge`.
///
/// # Errors
///
/// Returns an error if any startup step fails or the server stops
/// abnormally.
#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Load configuration.
    let (config, config_source) = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(config = %config_source, "simbridge starting");
    info!(
        host = %config.server.host,
        port = config.server.port,
        app_name = %config.source.app_name,
        fetch_timeout_ms = config.fetch.timeout_ms,
        dispatch = ?config.fetch.dispatch,
        data_points = config.data_points.len(),
        "Configuration loaded"
    );

    // 3. Build the data point catalog. A bad catalog fails before the source
    //    is touched.
    let catalog = Arc::new(Catalog::from_config(&config.data_points)?);
    info!(entries = catalog.len(), "Data point catalog built");

    // 4. Open the telemetry source.
    let sim = Arc::new(SimulatedSim::from_config(&config.source.simulated));
    let source = SimulatedSource::open(&config.source.app_name, sim)?;
    let dispatcher = Arc::new(Dispatcher::new(source));
    info!(app_name = %config.source.app_name, "Telemetry source opened");

    // 5. Wait for the handshake. The wait sleeps between pumps, so it runs
    //    on the blocking pool.
    {
        let dispatcher = Arc::clone(&dispatcher);
        let timeout = config.source.connect_timeout();
        let poll_interval = config.source.connect_poll_interval();
        tokio::task::spawn_blocking(move || dispatcher.await_connection(timeout, poll_interval))
            .await
            .map_err(|e| AppError::Task {
                message: format!("handshake task failed: {e}"),
            })??;
    }
    info!(
        application = dispatcher.connection().application().as_deref().unwrap_or_default(),
        "Source handshake complete"
    );

    // 6. Register data definitions. A rejected definition is fatal.
    let bridge = Arc::new(Bridge::new(
        catalog,
        Arc::clone(&dispatcher),
        FetchOptions::from(&config.fetch),
    ));
    let registered = bridge.register_definitions()?;
    info!(registered, "Data definitions registered");

    // 7. Start the dispatch thread.
    let dispatch_handle = match config.fetch.dispatch {
        DispatchMode::Background => Some(dispatcher.spawn(config.fetch.pump_interval())?),
        DispatchMode::Inline => {
            info!("Inline dispatch: fetches pump the source themselves");
            None
        }
    };

    // 8. Serve until Ctrl-C.
    let state = Arc::new(AppState::new(Arc::clone(&bridge), config.server.name.clone()));
    let server_config = ServerConfig::from(&config.server);
    let served = simbridge_server::start_server(&server_config, state, shutdown_signal()).await;

    // 9. Shut down the pump and the source, even if serving failed.
    if let Some(handle) = dispatch_handle {
        handle.stop();
        info!("Dispatch thread stopped");
    }
    if let Err(e) = dispatcher.close() {
        warn!(error = %e, "Failed to close telemetry source");
    }
    let stats = dispatcher.stats();
    info!(
        accepted = stats.accepted,
        discarded = stats.discarded,
        exceptions = stats.exceptions,
        "simbridge stopped"
    );

    served?;
    Ok(())
}

/// Resolve the config path from the command line and load it.
///
/// An explicit path must exist. The default path may be absent, in which
/// case the built-in defaults (plus environment overrides) are used.
fn load_config() -> Result<(BridgeConfig, String), AppError> {
    if let Some(arg) = std::env::args_os().nth(1) {
        let path = PathBuf::from(arg);
        let config = BridgeConfig::from_file(&path)?;
        return Ok((config, path.display().to_string()));
    }

    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        let config = BridgeConfig::from_file(default_path)?;
        Ok((config, String::from(DEFAULT_CONFIG_PATH)))
    } else {
        Ok((BridgeConfig::from_env()?, String::from("built-in defaults")))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve on Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }
}
