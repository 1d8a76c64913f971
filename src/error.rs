use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::services::ingest::IngestError;

#[derive(Debug)]
pub enum AppError {
    Ingest(IngestError),
    BadRequest(String),
    PayloadTooLarge(String),
    InternalServerError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Ingest(e) => {
                let status = match e {
                    IngestError::Validation(_) | IngestError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                    IngestError::NotFound(_) => StatusCode::NOT_FOUND,
                    IngestError::DuplicateId(_) => StatusCode::CONFLICT,
                    IngestError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    IngestError::StoreWrite { .. } | IngestError::StoreRead { .. } => StatusCode::BAD_GATEWAY,
                    IngestError::Repository { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    IngestError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                };
                let message = match e {
                    IngestError::Repository { .. } => {
                        "asset could not be recorded, upload must be retried from scratch".to_string()
                    }
                    IngestError::StoreWrite { .. } | IngestError::StoreRead { .. } => {
                        "storage backend failed".to_string()
                    }
                    other => other.to_string(),
                };
                (status, e.code(), message)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg.clone()),
            AppError::InternalServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            match &self {
                AppError::Ingest(e) => tracing::error!(code, error = %e, "request failed"),
                AppError::InternalServerError(msg) => tracing::error!(code, error = %msg, "request failed"),
                _ => {}
            }
        }

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        AppError::Ingest(err)
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(err.body_text())
        } else {
            AppError::BadRequest(format!("Invalid multipart data: {}", err.body_text()))
        }
    }
}
