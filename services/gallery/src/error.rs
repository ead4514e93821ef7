//! Service error taxonomy and its HTTP rendering.
//!
//! Startup failures (`Configuration`, `DependencyConnect`) never reach a
//! client; they abort the process before it serves traffic. Publish failures
//! are logged by the ingest path and never surface here either.

use crate::blob_store::BlobError;
use crate::config::ConfigError;
use crate::record::InvalidImageId;
use crate::record_store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("{message}")]
    Validation { message: String, code: &'static str },

    #[error("Failed to connect to {dependency}: {message}")]
    DependencyConnect {
        dependency: &'static str,
        message: String,
    },

    #[error("Image not found")]
    NotFound,

    #[error("Upload exceeds the size limit")]
    PayloadTooLarge,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl GalleryError {
    pub fn validation(message: impl Into<String>, code: &'static str) -> Self {
        Self::Validation {
            message: message.into(),
            code,
        }
    }

    pub fn dependency(dependency: &'static str, err: impl std::fmt::Display) -> Self {
        Self::DependencyConnect {
            dependency,
            message: err.to_string(),
        }
    }

    /// Label for a request turned away as the client's fault
    pub fn rejection_reason(&self) -> Option<&'static str> {
        match self {
            Self::Validation { code, .. } => Some(*code),
            Self::PayloadTooLarge => Some("PAYLOAD_TOO_LARGE"),
            _ => None,
        }
    }
}

impl From<InvalidImageId> for GalleryError {
    fn from(err: InvalidImageId) -> Self {
        Self::validation(err.to_string(), "INVALID_ID")
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl IntoResponse for GalleryError {
    fn into_response(self) -> Response {
        match self {
            GalleryError::NotFound => StatusCode::NOT_FOUND.into_response(),
            GalleryError::Validation { message, code } => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(message, code)),
            )
                .into_response(),
            GalleryError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse::new(
                    "Upload exceeds the size limit",
                    "PAYLOAD_TOO_LARGE",
                )),
            )
                .into_response(),
            other => {
                error!(error = %other, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new("Internal server error", "INTERNAL_ERROR")),
                )
                    .into_response()
            }
        }
    }
}
