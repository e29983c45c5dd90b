//! Boundary of the external telemetry source.
//!
//! The source is callback driven: a fetch is issued with
//! [`TelemetrySource::request_once`] and its answer only shows up later,
//! when somebody calls [`TelemetrySource::pump_dispatch`]. The pump invokes
//! the supplied callback synchronously, once per queued
//! [`SourceResponse`], on whatever thread performs the pump.
//!
//! Opening a connection is the job of each implementation's constructor
//! (see [`SimulatedSource::open`](crate::simulated::SimulatedSource::open)).

use serde::{Deserialize, Serialize};

use crate::ids::{DefinitionId, ObjectId, RequestId};

/// Errors reported by a telemetry source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The connection could not be opened.
    #[error("failed to open source connection: {message}")]
    Open {
        /// Description of the failure.
        message: String,
    },

    /// The source rejected a data definition.
    #[error("definition {definition_id} rejected: {reason}")]
    Definition {
        /// The definition that was rejected.
        definition_id: DefinitionId,
        /// Why the source refused it.
        reason: String,
    },

    /// The source rejected a fetch request.
    #[error("request {request_id} rejected: {reason}")]
    Request {
        /// The request that was rejected.
        request_id: RequestId,
        /// Why the source refused it.
        reason: String,
    },

    /// The connection has been closed.
    #[error("source connection is closed")]
    Closed,
}

/// Decode layout of a single data definition.
///
/// Every layout maps to a fixed payload size. `Bool` travels as a 32-bit
/// integer, as the source does for boolean variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// IEEE 754 double, little endian.
    Float64,
    /// IEEE 754 single, little endian.
    Float32,
    /// Signed 32-bit integer, little endian.
    Int32,
    /// Signed 64-bit integer, little endian.
    Int64,
    /// 32-bit integer where any non-zero value is true.
    Bool,
}

impl DataKind {
    /// Size in bytes of one encoded value.
    pub const fn size(self) -> usize {
        match self {
            Self::Float64 | Self::Int64 => 8,
            Self::Float32 | Self::Int32 | Self::Bool => 4,
        }
    }

    /// Encode a simulation variable's value in this layout.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(self, value: f64) -> Vec<u8> {
        match self {
            Self::Float64 => value.to_le_bytes().to_vec(),
            Self::Float32 => (value as f32).to_le_bytes().to_vec(),
            Self::Int32 => (value as i32).to_le_bytes().to_vec(),
            Self::Int64 => (value as i64).to_le_bytes().to_vec(),
            Self::Bool => i32::from(value != 0.0).to_le_bytes().to_vec(),
        }
    }
}

impl core::fmt::Display for DataKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Float64 => "float64",
            Self::Float32 => "float32",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A single record delivered by the dispatch pump.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceResponse {
    /// The connection handshake completed.
    Open {
        /// Name the source reports for itself.
        application: String,
    },

    /// Answer to a fetch.
    Data {
        /// Tag the fetch was issued with.
        request_id: RequestId,
        /// Layout the payload was encoded with.
        definition_id: DefinitionId,
        /// Object the values were read from.
        object_id: ObjectId,
        /// Raw encoded payload.
        payload: Vec<u8>,
    },

    /// The source refused an earlier call asynchronously.
    Exception {
        /// Source-specific exception code.
        code: u32,
        /// Human-readable detail.
        detail: String,
    },

    /// The source is shutting down; no further responses will arrive.
    Quit,
}

/// An open connection to a callback-driven telemetry source.
///
/// Implementations are not required to be reentrant. Callers share one
/// connection behind a single lock so at most one call is in progress.
pub trait TelemetrySource: Send {
    /// Register field `field`, measured in `unit` and encoded as `kind`,
    /// under `definition_id`.
    fn add_definition(
        &mut self,
        definition_id: DefinitionId,
        field: &str,
        unit: &str,
        kind: DataKind,
    ) -> Result<(), SourceError>;

    /// Ask for the current value of `definition_id` on `object_id`, exactly
    /// once. The answer is delivered by a later pump, tagged `request_id`.
    fn request_once(
        &mut self,
        request_id: RequestId,
        definition_id: DefinitionId,
        object_id: ObjectId,
    ) -> Result<(), SourceError>;

    /// Deliver every response queued so far to `on_response`, then return
    /// how many were delivered.
    fn pump_dispatch(
        &mut self,
        on_response: &mut dyn FnMut(SourceResponse),
    ) -> Result<usize, SourceError>;

    /// Close the connection. Later calls fail with [`SourceError::Closed`].
    fn close(&mut self) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_encoding() {
        for kind in [
            DataKind::Float64,
            DataKind::Float32,
            DataKind::Int32,
            DataKind::Int64,
            DataKind::Bool,
        ] {
            assert_eq!(kind.encode(1.0).len(), kind.size(), "{kind}");
        }
    }

    #[test]
    fn bool_encodes_nonzero_as_one() {
        assert_eq!(DataKind::Bool.encode(0.0), vec![0, 0, 0, 0]);
        assert_eq!(DataKind::Bool.encode(-3.0), vec![1, 0, 0, 0]);
    }
}
