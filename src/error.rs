//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a specific HTTP status code and structured JSON error response.
//! Streaming sessions render the same variants as a flat error frame (see
//! [`GatewayError::to_frame`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::broker::BrokerError;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "message": "invalid argument: Invalid queue name."
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`GatewayError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error frame sent over a WebSocket session right before it is closed.
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    /// Human-readable error message.
    pub error: String,
    /// HTTP status code equivalent of the failure.
    pub code: u16,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category        | HTTP Status                  |
/// |-----------|-----------------|------------------------------|
/// | 1000–1999 | Validation      | 400 Bad Request / 413        |
/// | 2000–2999 | Not Found       | 404 Not Found                |
/// | 3000–3999 | Server          | 500 Internal Server Error    |
/// | 5000–5999 | Broker          | 500 / 503 Service Unavailable |
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Malformed scope, TTL, limit or encoding.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Message body or stream frame exceeds the configured size.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Queue (or other broker resource) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad WebSocket upgrade negotiation.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Malformed client frame in a streaming session.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Cannot connect to the broker or open a channel on it.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A broker operation failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Gateway-side failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 1001,
            Self::InvalidHeader(_) => 1002,
            Self::InvalidContent(_) => 1003,
            Self::PayloadTooLarge(_) => 1004,
            Self::NotFound(_) => 2001,
            Self::Internal(_) => 3000,
            Self::BrokerUnavailable(_) => 5001,
            Self::Broker(_) => 5002,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::InvalidHeader(_) | Self::InvalidContent(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Broker(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders the error as a WebSocket error frame.
    #[must_use]
    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame {
            error: self.to_string(),
            code: self.status_code().as_u16(),
        }
    }
}

impl From<BrokerError> for GatewayError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => Self::BrokerUnavailable(msg),
            BrokerError::NotFound(msg) => Self::NotFound(msg),
            BrokerError::Closed(msg) | BrokerError::Operation(msg) => Self::Broker(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_categories() {
        assert_eq!(
            GatewayError::InvalidArgument(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::PayloadTooLarge(String::new()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::NotFound(String::new()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::BrokerUnavailable(String::new()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn broker_not_found_maps_to_not_found() {
        let err = GatewayError::from(BrokerError::NotFound("no queue 'p_q'".to_string()));
        assert!(matches!(err, GatewayError::NotFound(_)));
        let err = GatewayError::from(BrokerError::Closed("channel closed".to_string()));
        assert!(matches!(err, GatewayError::Broker(_)));
    }

    #[test]
    fn frame_carries_http_status() {
        let frame = GatewayError::PayloadTooLarge("Message too large.".to_string()).to_frame();
        assert_eq!(frame.code, 413);
        let Ok(json) = serde_json::to_value(&frame) else {
            panic!("serialization failed");
        };
        assert_eq!(json["code"], 413);
        assert_eq!(json["error"], "payload too large: Message too large.");
    }
}
