//! Configuration loading and typed config structures for `SimBridge`.
//!
//! The configuration lives in a YAML file (`simbridge.yaml` by default).
//! Every section and field has a default, so an empty file, or no file at
//! all, yields a bridge serving the throttle data point on port 8080.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ids::{DefinitionId, RequestId};
use crate::source::DataKind;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    Env {
        /// The environment variable.
        name: &'static str,
        /// Its raw value.
        value: String,
    },

    /// A value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Telemetry source connection settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Blocking fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Data points served under `/simobject/<name>`.
    #[serde(default = "default_data_points")]
    pub data_points: Vec<DataPointConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            source: SourceConfig::default(),
            fetch: FetchConfig::default(),
            logging: LoggingConfig::default(),
            data_points: default_data_points(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values for the listener:
    /// - `SIMBRIDGE_HOST` overrides `server.host`
    /// - `SIMBRIDGE_PORT` overrides `server.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Env`]/[`ConfigError::Invalid`] if a value is unusable.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.server.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if an override cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.server.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty map.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("fetch.timeout_ms must be greater than zero"),
            });
        }
        if self.fetch.pump_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("fetch.pump_interval_ms must be greater than zero"),
            });
        }
        if self.source.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: String::from("source.connect_timeout_ms must be greater than zero"),
            });
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSettings {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Name reported by the index and health endpoints.
    #[serde(default = "default_server_name")]
    pub name: String,
}

impl ServerSettings {
    /// Override listener settings with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if `SIMBRIDGE_PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("SIMBRIDGE_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("SIMBRIDGE_PORT") {
            self.port = val.parse().map_err(|_err: std::num::ParseIntError| ConfigError::Env {
                name: "SIMBRIDGE_PORT",
                value: val.clone(),
            })?;
        }
        Ok(())
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_server_name(),
        }
    }
}

/// Telemetry source connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    /// Application name announced when opening the connection.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// How long startup waits for the handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Pause between pumps while waiting for the handshake.
    #[serde(default = "default_connect_poll_interval_ms")]
    pub connect_poll_interval_ms: u64,

    /// Settings of the in-process simulated source.
    #[serde(default)]
    pub simulated: SimulatedConfig,
}

impl SourceConfig {
    /// Handshake deadline.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake poll interval.
    pub const fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_poll_interval_ms: default_connect_poll_interval_ms(),
            simulated: SimulatedConfig::default(),
        }
    }
}

/// Settings of the simulated source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedConfig {
    /// Initial simulation variable values, keyed by field name.
    #[serde(default = "default_simulated_values")]
    pub values: BTreeMap<String, f64>,

    /// Delay before the handshake completes.
    #[serde(default)]
    pub handshake_delay_ms: u64,

    /// Fixed latency of every fetch.
    #[serde(default)]
    pub response_delay_ms: u64,

    /// Random extra latency, up to this many milliseconds.
    #[serde(default)]
    pub response_jitter_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            values: default_simulated_values(),
            handshake_delay_ms: 0,
            response_delay_ms: 0,
            response_jitter_ms: 0,
        }
    }
}

/// Where the dispatch pump runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// A dedicated thread pumps continuously; fetches only wait.
    #[default]
    Background,
    /// Each waiting fetch pumps the source itself between waits.
    Inline,
}

/// Blocking fetch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FetchConfig {
    /// Deadline for a single fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,

    /// Where the dispatch pump runs.
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Pause between idle pumps.
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
}

impl FetchConfig {
    /// Deadline for a single fetch.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause between idle pumps.
    pub const fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fetch_timeout_ms(),
            dispatch: DispatchMode::default(),
            pump_interval_ms: default_pump_interval_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// One servable data point.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataPointConfig {
    /// Name exposed under `/simobject/<name>`.
    pub name: String,

    /// Tag for this data point's fetches. Unique across data points.
    pub request_id: RequestId,

    /// Definition the field is registered under.
    pub definition_id: DefinitionId,

    /// Simulation variable to read.
    pub field: String,

    /// Unit the source converts the variable to.
    #[serde(default = "default_unit")]
    pub unit: String,

    /// Encoding of the value.
    #[serde(default = "default_kind")]
    pub kind: DataKind,
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

/// Simulation variable behind the default `throttle` data point.
pub const THROTTLE_FIELD: &str = "GENERAL ENG THROTTLE LEVER POSITION:1";

fn default_data_points() -> Vec<DataPointConfig> {
    vec![DataPointConfig {
        name: String::from("throttle"),
        request_id: RequestId(1),
        definition_id: DefinitionId(1),
        field: String::from(THROTTLE_FIELD),
        unit: String::from("percent"),
        kind: DataKind::Float64,
    }]
}

fn default_simulated_values() -> BTreeMap<String, f64> {
    let mut m = BTreeMap::new();
    m.insert(String::from(THROTTLE_FIELD), 42.5);
    m
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "SimConnect Bridge".to_owned()
}

fn default_app_name() -> String {
    "SimConnect Bridge".to_owned()
}

const fn default_connect_timeout_ms() -> u64 {
    30_000
}

const fn default_connect_poll_interval_ms() -> u64 {
    500
}

const fn default_fetch_timeout_ms() -> u64 {
    5_000
}

const fn default_pump_interval_ms() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_unit() -> String {
    "number".to_owned()
}

const fn default_kind() -> DataKind {
    DataKind::Float64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BridgeConfig::parse("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.data_points.len(), 1);
        assert_eq!(config.data_points[0].name, "throttle");
        assert_eq!(config.fetch.dispatch, DispatchMode::Background);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let yaml = r"
server:
  port: 9090
fetch:
  timeout_ms: 250
  dispatch: inline
";
        let config = BridgeConfig::parse(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.fetch.timeout(), Duration::from_millis(250));
        assert_eq!(config.fetch.dispatch, DispatchMode::Inline);
        assert_eq!(config.source.connect_poll_interval_ms, 500);
    }

    #[test]
    fn data_points_parse_with_defaults() {
        let yaml = r"
data_points:
  - name: altitude
    request_id: 2
    definition_id: 2
    field: PLANE ALTITUDE
    unit: feet
    kind: int32
  - name: mixture
    request_id: 3
    definition_id: 3
    field: GENERAL ENG MIXTURE LEVER POSITION:1
";
        let config = BridgeConfig::parse(yaml).unwrap();
        assert_eq!(config.data_points.len(), 2);
        assert_eq!(config.data_points[0].kind, DataKind::Int32);
        assert_eq!(config.data_points[0].request_id, RequestId(2));
        assert_eq!(config.data_points[1].unit, "number");
        assert_eq!(config.data_points[1].kind, DataKind::Float64);
    }

    #[test]
    fn simulated_values_parse() {
        let yaml = r"
source:
  simulated:
    response_delay_ms: 15
    values:
      PLANE ALTITUDE: 1200
";
        let config = BridgeConfig::parse(yaml).unwrap();
        assert_eq!(config.source.simulated.response_delay_ms, 15);
        assert_eq!(
            config.source.simulated.values.get("PLANE ALTITUDE").copied(),
            Some(1200.0)
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = BridgeConfig::parse("fetch:\n  timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_pump_interval_is_rejected() {
        let err = BridgeConfig::parse("fetch:\n  pump_interval_ms: 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref reason } if reason.contains("pump_interval_ms")
        ));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = BridgeConfig::parse("server: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn shipped_config_parses() {
        let config = BridgeConfig::parse(include_str!("../../../simbridge.yaml")).unwrap();
        assert_eq!(config.data_points.len(), 3);
        assert_eq!(config.data_points[0].field, THROTTLE_FIELD);
        assert_eq!(config.data_points[2].kind, DataKind::Bool);
        assert_eq!(config.fetch.dispatch, DispatchMode::Background);
    }

    #[test]
    fn unknown_dispatch_mode_is_rejected() {
        assert!(BridgeConfig::parse("fetch:\n  dispatch: sideways\n").is_err());
    }
}
