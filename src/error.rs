use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use config::ConfigError;
use thiserror::Error;
use tracing::error;

use crate::manifest::ManifestError;
use crate::verify::VerificationErrors;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("Manifest metadata media type must be specified")]
    MediaTypeUnspecified,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Verification(#[from] VerificationErrors),

    #[error("Wrong manifest type put to {handler} handler")]
    WrongManifestType { handler: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] opendal::Error),

    #[error("Json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Structured error code rendered to clients, one per error kind
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            AppError::MediaTypeUnspecified => "MANIFEST_METADATA_MEDIA_TYPE_UNSPECIFIED",
            AppError::Manifest(ManifestError::UnsupportedMediaType(_)) => "UNSUPPORTED",
            AppError::Manifest(_) => "MANIFEST_INVALID",
            AppError::Verification(_) => "MANIFEST_BLOB_UNKNOWN",
            // Internal kinds collapse to UNKNOWN rather than leaking detail
            AppError::WrongManifestType { .. }
            | AppError::Storage(_)
            | AppError::JsonError(_)
            | AppError::Internal(_)
            | AppError::Config(_) => "UNKNOWN",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::ManifestUnknown(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::MediaTypeUnspecified
            | AppError::Manifest(ManifestError::UnsupportedMediaType(_)) => StatusCode::BAD_REQUEST,
            AppError::Manifest(_) | AppError::Verification(_) => StatusCode::BAD_REQUEST,
            AppError::WrongManifestType { .. }
            | AppError::Storage(_)
            | AppError::JsonError(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        if status.is_server_error() {
            error!("request failed: {:?}", self);
        }

        // Verification aggregates carry every missing reference; surface the
        // full list in the detail field
        let detail = match &self {
            AppError::Verification(errs) => Some(serde_json::json!(
                errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
            )),
            _ => None,
        };

        let message = if status.is_server_error() {
            // Do not leak internal error chains to clients
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": detail,
            }]
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
