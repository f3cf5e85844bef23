use crate::services::error::{TransferError, ValidationError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let status = match &err {
            TransferError::Validation(ValidationError::FileTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            TransferError::Validation(_) => StatusCode::BAD_REQUEST,
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::Gone(_) => StatusCode::GONE,
            TransferError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            TransferError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            // backend detail stays in the log
            error!(error = %err, "request failed: backend unavailable");
            return AppError::new(status, "storage temporarily unavailable");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        TransferError::from(err).into()
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn transfer_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (TransferError::Validation(ValidationError::EmptyFileName), StatusCode::BAD_REQUEST),
            (
                TransferError::Validation(ValidationError::FileTooLarge { limit_bytes: 1 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (TransferError::NotFound(id), StatusCode::NOT_FOUND),
            (TransferError::Gone(id), StatusCode::GONE),
            (TransferError::LimitExceeded(id), StatusCode::TOO_MANY_REQUESTS),
            (
                TransferError::BackendUnavailable("disk on fire".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn backend_details_are_not_leaked() {
        let err = AppError::from(TransferError::BackendUnavailable("/var/db locked".into()));
        assert!(!err.message.contains("/var/db"));
    }

    #[tokio::test]
    async fn renders_json_body() {
        let response = AppError::from(TransferError::Gone(Uuid::nil())).into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], 410);
        assert!(value["error"].as_str().unwrap().contains("expired"));
    }
}
