// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nodewarden_core::errors::{CoreError, ErrorClass};
use serde_json::json;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AppError {
    /// The node has to enroll again.
    #[error("node invalid")]
    NodeInvalid,
    #[error("environment not found")]
    EnvironmentNotFound,
    #[error("{0} not found")]
    NotFound(String),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("carve reconstruction failed: {0}")]
    ReconstructionError(String),
    #[error("internal server error")]
    InternalServerError,
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            // agents only re-enroll on a 200 carrying node_invalid
            Self::NodeInvalid => {
                return (StatusCode::OK, Json(json!({"node_invalid": true}))).into_response();
            }
            Self::EnvironmentNotFound => {
                (StatusCode::NOT_FOUND, "Environment not found".to_string())
            }
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::ServiceUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
            ),
            Self::ReconstructionError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unable to reconstruct carve".to_string(),
            ),
            Self::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
            Self::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({"code": status.as_u16(), "message": message}));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(source: CoreError) -> Self {
        match source.class() {
            ErrorClass::Authentication => {
                tracing::debug!("[service] {}", source);
                AppError::NodeInvalid
            }
            ErrorClass::Validation => AppError::ValidationError(source.to_string()),
            ErrorClass::NotFound => match source {
                CoreError::UnknownEnvironment => AppError::EnvironmentNotFound,
                CoreError::NotFound(what) => AppError::NotFound(what),
                other => AppError::NotFound(other.to_string()),
            },
            ErrorClass::Transient => {
                tracing::warn!("[service] {}", source);
                AppError::ServiceUnavailable(source.to_string())
            }
            ErrorClass::Reconstruction => {
                tracing::error!("[service] {}", source);
                AppError::ReconstructionError(source.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(_source: serde_json::Error) -> Self {
        tracing::error!("{:?}", _source);
        AppError::InternalServerError
    }
}

impl From<anyhow::Error> for AppError {
    fn from(_source: anyhow::Error) -> Self {
        tracing::error!("{:?}", _source);
        AppError::InternalServerError
    }
}

impl From<std::io::Error> for AppError {
    fn from(_source: std::io::Error) -> Self {
        tracing::error!("{:?}", _source);
        AppError::InternalServerError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(error: AppError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_authentication_errors_ask_for_enroll() {
        for error in [
            CoreError::InvalidNodeKey,
            CoreError::InvalidEnrollSecret,
            CoreError::EnrollExpired,
        ] {
            let (status, body) = render(AppError::from(error)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"node_invalid": true}));
        }
    }

    #[tokio::test]
    async fn test_status_per_class() {
        let cases = [
            (CoreError::ValidationError("bad".into()), StatusCode::BAD_REQUEST),
            (CoreError::UnknownEnvironment, StatusCode::NOT_FOUND),
            (CoreError::NotFound("carve session".into()), StatusCode::NOT_FOUND),
            (CoreError::StorageError("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::LoggerError("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                CoreError::ReconstructionError("s3".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let (status, body) = render(AppError::from(error)).await;
            assert_eq!(status, expected);
            assert_eq!(body["code"], expected.as_u16());
        }
    }

    #[tokio::test]
    async fn test_transient_message_hides_details() {
        let (_, body) = render(AppError::from(CoreError::StorageError(
            "connection refused to 10.0.0.5".into(),
        )))
        .await;
        assert_eq!(body["message"], "Service temporarily unavailable");
    }
}
