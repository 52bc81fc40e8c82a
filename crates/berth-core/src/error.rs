//! Gateway errors and their HTTP rendering.
//!
//! Every failure is local to the request that produced it. Classification
//! failures are the caller's fault and map to `400`; everything else derives
//! its status from the message, the same way Engine API clients expect.

use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::classify::ClassifyError;
use crate::executor::ExecError;
use crate::translate::TranslateError;

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway for a single request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("failed to connect to daemon socket at {path}: {source}")]
    Dial {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon request failed: {0}")]
    Backend(String),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("connection hijack failed: {0}")]
    Hijack(String),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Message keywords mapped to the status they imply, checked in order.
const STATUS_KEYWORDS: &[(&str, StatusCode)] = &[
    ("not found", StatusCode::NOT_FOUND),
    ("no such", StatusCode::NOT_FOUND),
    ("bad parameter", StatusCode::BAD_REQUEST),
    ("conflict", StatusCode::CONFLICT),
    ("impossible", StatusCode::NOT_ACCEPTABLE),
    ("wrong login/password", StatusCode::UNAUTHORIZED),
    ("hasn't been activated", StatusCode::FORBIDDEN),
];

/// Derive an HTTP status from an error message.
pub fn status_for_message(message: &str) -> StatusCode {
    let lowered = message.to_lowercase();
    STATUS_KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, |(_, status)| *status)
}

impl GatewayError {
    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Classify(_) => StatusCode::BAD_REQUEST,
            // The io error text ("No such file or directory") must not read as a 404.
            GatewayError::Dial { .. } | GatewayError::Exec(ExecError::Spawn { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            other => status_for_message(&other.to_string()),
        }
    }
}

/// Engine API error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        tracing::error!(status = status.as_u16(), error = %message, "request failed");
        (status, Json(ErrorBody { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keyword_table() {
        assert_eq!(status_for_message("image not found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_message("No such container: x"), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for_message("bad parameter: missing image"),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for_message("Conflict. name in use"), StatusCode::CONFLICT);
        assert_eq!(
            status_for_message("impossible to do that"),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            status_for_message("Wrong login/password"),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for_message("account hasn't been activated"),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for_message("something exploded"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_classification_errors_are_client_errors() {
        let err = GatewayError::from(ClassifyError::MissingDetach);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_dial_error_is_server_error() {
        let err = GatewayError::Dial {
            path: PathBuf::from("/var/run/docker-real.sock"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let err = GatewayError::Backend("no such image: busybox".to_string());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value["message"],
            "daemon request failed: no such image: busybox"
        );
    }
}
