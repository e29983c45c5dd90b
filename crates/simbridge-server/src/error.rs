//! Error types for the data point API.
//!
//! [`ApiError`] unifies all failure modes into a single enum that can be
//! converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use simbridge_core::bridge::FetchError;

/// Errors that can occur in the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Fetching a data point failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status reported for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Fetch(e) => fetch_status(e),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Map a fetch failure to the status a client should see.
pub const fn fetch_status(error: &FetchError) -> StatusCode {
    match error {
        FetchError::UnknownEntry { .. } | FetchError::UnknownHandle { .. } => {
            StatusCode::NOT_FOUND
        }
        FetchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FetchError::NotConnected | FetchError::Disconnected | FetchError::InFlight(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FetchError::ShortPayload { .. } | FetchError::Format { .. } | FetchError::Source(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use simbridge_core::ids::RequestId;
    use simbridge_core::source::SourceError;

    use super::*;

    #[test]
    fn fetch_errors_map_to_gateway_statuses() {
        let timeout = FetchError::Timeout {
            name: String::from("throttle"),
            request_id: RequestId(1),
            waited_ms: 5000,
        };
        assert_eq!(fetch_status(&timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            fetch_status(&FetchError::NotConnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            fetch_status(&FetchError::Disconnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            fetch_status(&FetchError::Source(SourceError::Closed)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(FetchError::UnknownEntry {
                name: String::from("mixture")
            })
            .status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn failed_blocking_task_is_internal() {
        let err = ApiError::Internal(String::from("fetch task failed: cancelled"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "internal error: fetch task failed: cancelled");
    }
}
