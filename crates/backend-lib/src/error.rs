// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error taxonomy.
///
/// Failures local to one connection never propagate to other connections:
/// decode errors are logged and dropped, persistence failures flag the
/// outbound envelope, and an undelivered bridge publish is not retried.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("transport rejected: {0}")]
    TransportRejected(String),

    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("fan-out bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// HTTP status for failures surfaced on the upgrade path.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::TransportRejected(_) => StatusCode::FORBIDDEN,
            ChatError::Decode(_) => StatusCode::BAD_REQUEST,
            ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Persistence(_)
            | ChatError::BridgeUnavailable(_)
            | ChatError::Io(_)
            | ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::TransportRejected(_) => "transport_rejected",
            ChatError::Decode(_) => "decode_error",
            ChatError::RoomNotFound(_) => "room_not_found",
            ChatError::Persistence(_) => "persistence_failure",
            ChatError::BridgeUnavailable(_) => "bridge_unavailable",
            ChatError::Io(_) => "io_error",
            ChatError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ChatError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ChatError::Internal("registry unavailable".to_string())
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::BridgeUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ChatError::TransportRejected("bad token".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ChatError::RoomNotFound("r1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ChatError::Persistence("disk full".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ChatError::BridgeUnavailable("down".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            ChatError::RoomNotFound("r1".to_string()).error_code(),
            "room_not_found"
        );
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert_eq!(ChatError::Decode(json_err).error_code(), "decode_error");
    }

    #[test]
    fn test_into_response() {
        let response = ChatError::RoomNotFound("r1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/json"));
    }

    #[test]
    fn test_channel_send_error_maps_to_internal() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        drop(rx);
        let err: ChatError = tx.send(1).unwrap_err().into();
        assert!(matches!(err, ChatError::Internal(_)));
    }
}
