//! # Error Handling
//!
//! Custom error types for the transcription pipeline and their conversion
//! to HTTP responses.
//!
//! ## Error Categories:
//! - **Validation errors** (missing/oversized/unsupported file): caused by the
//!   caller, mapped to 4xx, never retried
//! - **Decode errors** (unreadable audio): caller-caused, 4xx, never retried
//! - **EngineLoad / Device errors**: server-side model and driver faults;
//!   device faults are the only class the retry controller reacts to
//! - **Job errors**: anything else that ends a transcription job
//!
//! All of them serialize to the same JSON envelope so pollers and the
//! deployment harness can parse failures uniformly.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error taxonomy.
///
/// Each variant carries a human-readable message. The variant decides the
/// HTTP status and the machine-readable `type` field in the response body.
#[derive(Debug)]
pub enum AppError {
    /// Input file (or job id) does not exist
    NotFound(String),

    /// Input file exceeds the configured maximum size
    TooLarge(String),

    /// Input file extension is not in the supported set
    UnsupportedFormat(String),

    /// Audio file exists but cannot be read/decoded
    Decode(String),

    /// Model failed to load on every attempted device
    EngineLoad(String),

    /// Transient accelerated-device/driver fault
    Device(String),

    /// Malformed request (e.g. missing file_path)
    BadRequest(String),

    /// Any other failure that terminates a job
    Job(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::TooLarge(msg) => write!(f, "File too large: {}", msg),
            AppError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            AppError::Decode(msg) => write!(f, "Audio decode error: {}", msg),
            AppError::EngineLoad(msg) => write!(f, "Engine load error: {}", msg),
            AppError::Device(msg) => write!(f, "Device error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Job(msg) => write!(f, "Job error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::TooLarge(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "file_too_large",
                msg.clone(),
            ),
            AppError::UnsupportedFormat(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "unsupported_format",
                msg.clone(),
            ),
            AppError::Decode(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "decode_error",
                msg.clone(),
            ),
            AppError::EngineLoad(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "engine_load_error",
                msg.clone(),
            ),
            AppError::Device(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "device_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Job(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "job_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl AppError {
    /// True for errors caused by the request itself; these are never retried
    /// and never trigger a device downgrade.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_)
                | AppError::TooLarge(_)
                | AppError::UnsupportedFormat(_)
                | AppError::Decode(_)
                | AppError::BadRequest(_)
        )
    }
}

/// Generic pipeline failures become job errors; more specific variants are
/// constructed explicitly at their source.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Job(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Job(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
