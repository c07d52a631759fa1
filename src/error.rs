//! Error types for the JustData engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stable numeric error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    Validation = 2,
    UnknownJob = 3,
    JobNotTerminal = 4,
    ReportExpired = 5,
    UnsupportedFormat = 6,
    WarehouseUnavailable = 7,
    WarehouseFailure = 8,
    CensusFailure = 9,
    NarrativeFailure = 10,
    Cancelled = 11,
    Timeout = 12,
    StorageFailure = 13,
}

/// Main application error type.
///
/// Warehouse failures are fatal to a job; census and narrative failures
/// degrade gracefully and only surface here when a client operation itself
/// fails.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job not yet terminal: {0}")]
    JobNotTerminal(String),

    #[error("Report expired: {0}")]
    ReportExpired(String),

    #[error("Unsupported download format: {0}")]
    UnsupportedFormat(String),

    #[error("Warehouse unavailable: {0}")]
    WarehouseUnavailable(String),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] crate::warehouse::WarehouseError),

    #[error("Census error: {0}")]
    Census(#[from] crate::census::CensusError),

    #[error("Narrative error: {0}")]
    Narrative(#[from] crate::ai::AiError),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job timed out")]
    Timeout,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, ErrorCode::Validation, msg.clone()),
            AppError::UnknownJob(msg) => (StatusCode::NOT_FOUND, ErrorCode::UnknownJob, msg.clone()),
            AppError::JobNotTerminal(msg) => {
                (StatusCode::CONFLICT, ErrorCode::JobNotTerminal, msg.clone())
            }
            AppError::ReportExpired(msg) => (StatusCode::GONE, ErrorCode::ReportExpired, msg.clone()),
            AppError::UnsupportedFormat(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorCode::UnsupportedFormat,
                msg.clone(),
            ),
            AppError::WarehouseUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::WarehouseUnavailable,
                msg.clone(),
            ),
            AppError::Warehouse(e) => {
                tracing::error!("Warehouse error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::WarehouseFailure,
                    "Warehouse error".to_string(),
                )
            }
            AppError::Census(e) => {
                tracing::warn!("Census error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::CensusFailure,
                    "Census error".to_string(),
                )
            }
            AppError::Narrative(e) => {
                tracing::warn!("Narrative error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::NarrativeFailure,
                    "Narrative error".to_string(),
                )
            }
            AppError::Cancelled => (
                StatusCode::CONFLICT,
                ErrorCode::Cancelled,
                "Job cancelled".to_string(),
            ),
            AppError::Timeout => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Timeout,
                "timeout".to_string(),
            ),
            AppError::Storage(msg) => {
                tracing::error!("Storage error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::StorageFailure,
                    "Storage error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
