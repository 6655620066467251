//! # Error Handling
//!
//! This module defines the bridge's error type and how it's converted to HTTP
//! responses for the few plain HTTP paths (e.g. rejecting a WebSocket upgrade).
//!
//! ## Error Taxonomy:
//! The variants follow how far an error is allowed to reach:
//! - **Protocol / Decode**: one signal or frame is dropped, the call continues
//! - **Backpressure** is not an error: a full queue reports
//!   [`SubmitOutcome::Dropped`](crate::room::SubmitOutcome) or
//!   [`Delivery::Dropped`](crate::bridge::inbound::Delivery), and the frame is
//!   counted and dropped
//! - **RoomConnect / Publish / Transport**: fatal to one call, never the process
//! - **Capacity**: surfaces on the HTTP side before the upgrade

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors produced while bridging one call.
///
/// ## Usage Example:
/// ```rust
/// return Err(BridgeError::Protocol("missing streamSid".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Wire signal could not be parsed or violates the event schema
    Protocol(String),

    /// Audio payload or room frame could not be transcoded
    Decode(String),

    /// Connecting to the room failed (never retried)
    RoomConnect(String),

    /// Publishing the synthetic caller track failed
    Publish(String),

    /// Duplex connection or room transport failed mid-call
    Transport(String),

    /// Too many concurrent calls
    Capacity(String),
}

impl BridgeError {
    /// Short machine-readable name, used in logs and JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Protocol(_) => "protocol_error",
            BridgeError::Decode(_) => "decode_error",
            BridgeError::RoomConnect(_) => "room_connect_error",
            BridgeError::Publish(_) => "publish_error",
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Capacity(_) => "capacity_exceeded",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            BridgeError::Decode(msg) => write!(f, "Decode error: {}", msg),
            BridgeError::RoomConnect(msg) => write!(f, "Room connect failed: {}", msg),
            BridgeError::Publish(msg) => write!(f, "Track publish failed: {}", msg),
            BridgeError::Transport(msg) => write!(f, "Transport error: {}", msg),
            BridgeError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// HTTP mapping for errors that surface before a WebSocket is established.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "capacity_exceeded",
///     "message": "200 calls already active",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for BridgeError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            BridgeError::Protocol(_) | BridgeError::Decode(_) => StatusCode::BAD_REQUEST,
            BridgeError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::RoomConnect(_) | BridgeError::Publish(_) | BridgeError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            BridgeError::Protocol(msg)
            | BridgeError::Decode(msg)
            | BridgeError::RoomConnect(msg)
            | BridgeError::Publish(msg)
            | BridgeError::Transport(msg)
            | BridgeError::Capacity(msg) => msg.clone(),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Malformed JSON on the wire is a protocol error, not a session failure.
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// A payload that is not valid base64 cannot be decoded into samples.
impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Decode(format!("invalid base64 payload: {}", err))
    }
}

/// Type alias for Results that use the bridge error type.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_json_error_converts_to_protocol() {
        let err: BridgeError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn test_capacity_maps_to_503() {
        let err = BridgeError::Capacity("full".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
