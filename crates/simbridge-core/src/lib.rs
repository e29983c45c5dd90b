//! Data point catalog, fetch coordination, and the blocking fetch bridge
//! for `SimBridge`.
//!
//! `SimBridge` exposes flight-simulator variables over HTTP. The simulator's
//! SDK answers requests asynchronously through a dispatch callback; this
//! crate turns that into a blocking "fetch one data point" call that the
//! HTTP layer can serve from.
//!
//! # Modules
//!
//! - [`bridge`] -- [`Bridge`], the blocking fetch over a catalog.
//! - [`catalog`] -- Named data points, their request ids, payload sizes,
//!   and formatters.
//! - [`config`] -- Configuration loading from `simbridge.yaml` into
//!   strongly-typed structs.
//! - [`connection`] -- Connected/disconnected flags set by the pump.
//! - [`dispatch`] -- [`Dispatcher`], which owns the source handle and
//!   routes responses to waiting fetches.
//! - [`ids`] -- Request, definition, and object id newtypes.
//! - [`pending`] -- Per-fetch rendezvous slots and their registry.
//! - [`simulated`] -- In-process simulator used when no real one is attached.
//! - [`source`] -- [`TelemetrySource`], the seam to the simulator SDK.
//!
//! [`Bridge`]: bridge::Bridge
//! [`Dispatcher`]: dispatch::Dispatcher
//! [`TelemetrySource`]: source::TelemetrySource

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod ids;
pub mod pending;
pub mod simulated;
pub mod source;
