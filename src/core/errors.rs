// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum FramegateError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Invalid transformation options: {0}")]
    Validation(String),

    #[error("No source yielded the requested content: {0}")]
    NotFound(String),

    #[error("Upstream rejected transformation parameters: {0}")]
    ParameterError(String),

    #[error("Seek time is outside the source duration: {0}")]
    SeekTimeError(String),

    #[error("Transformation mode rejected by upstream: {0}")]
    InvalidModeError(String),

    #[error("Output format rejected by upstream: {0}")]
    FormatError(String),

    /// The requested duration exceeds the upstream limit. Carries the parsed
    /// upper bound in whole seconds when the upstream reported one, so the
    /// orchestrator can retry once with an adjusted duration.
    #[error("Duration exceeds upstream limit of {max_seconds}s")]
    DurationLimit { max_seconds: u64 },

    #[error("Source file exceeds the size limit: {0}")]
    FileSizeLimit(String),

    #[error("Source format is not supported by the transformer: {0}")]
    UnsupportedFormat(String),

    #[error("Transformation endpoint rate limit exceeded")]
    RateLimit,

    #[error("Transformation endpoint fault (status {status})")]
    ServerError { status: u16 },

    #[error("Stored chunk size disagrees with manifest beyond tolerance: {0}")]
    ChunkIntegrity(String),

    #[error("Too many distinct requests in flight")]
    CoalescingLimit,

    #[error("Request cancelled by the client")]
    Cancelled,

    #[error("Range not satisfiable for total size {total}")]
    RangeNotSatisfiable { total: u64 },

    #[error("Storage Error: {0}")]
    KvStorage(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl FramegateError {
    /// The diagnostic error class reported to callers in the `X-Error-Type` header.
    pub fn error_type(&self) -> &'static str {
        match self {
            FramegateError::Validation(_)
            | FramegateError::ParameterError(_)
            | FramegateError::SeekTimeError(_)
            | FramegateError::InvalidModeError(_)
            | FramegateError::FormatError(_)
            | FramegateError::DurationLimit { .. } => "parameter_error",
            FramegateError::NotFound(_) => "not_found",
            FramegateError::FileSizeLimit(_) => "file_size_limit",
            FramegateError::UnsupportedFormat(_) => "unsupported_format",
            FramegateError::RateLimit => "rate_limit",
            FramegateError::ChunkIntegrity(_) => "chunk_integrity",
            _ => "server_error",
        }
    }

    /// The HTTP status this error surfaces as when no fallback intercepts it.
    pub fn http_status(&self) -> u16 {
        match self {
            FramegateError::Validation(_)
            | FramegateError::ParameterError(_)
            | FramegateError::SeekTimeError(_)
            | FramegateError::InvalidModeError(_)
            | FramegateError::FormatError(_)
            | FramegateError::DurationLimit { .. } => 400,
            FramegateError::NotFound(_) => 404,
            FramegateError::FileSizeLimit(_) => 413,
            FramegateError::UnsupportedFormat(_) => 415,
            FramegateError::RangeNotSatisfiable { .. } => 416,
            FramegateError::RateLimit => 429,
            FramegateError::CoalescingLimit => 503,
            FramegateError::ServerError { .. } => 502,
            _ => 500,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for FramegateError {
    fn clone(&self) -> Self {
        match self {
            FramegateError::Io(e) => FramegateError::Io(Arc::clone(e)),
            FramegateError::HttpClient(s) => FramegateError::HttpClient(s.clone()),
            FramegateError::Validation(s) => FramegateError::Validation(s.clone()),
            FramegateError::NotFound(s) => FramegateError::NotFound(s.clone()),
            FramegateError::ParameterError(s) => FramegateError::ParameterError(s.clone()),
            FramegateError::SeekTimeError(s) => FramegateError::SeekTimeError(s.clone()),
            FramegateError::InvalidModeError(s) => FramegateError::InvalidModeError(s.clone()),
            FramegateError::FormatError(s) => FramegateError::FormatError(s.clone()),
            FramegateError::DurationLimit { max_seconds } => FramegateError::DurationLimit {
                max_seconds: *max_seconds,
            },
            FramegateError::FileSizeLimit(s) => FramegateError::FileSizeLimit(s.clone()),
            FramegateError::UnsupportedFormat(s) => FramegateError::UnsupportedFormat(s.clone()),
            FramegateError::RateLimit => FramegateError::RateLimit,
            FramegateError::ServerError { status } => FramegateError::ServerError {
                status: *status,
            },
            FramegateError::ChunkIntegrity(s) => FramegateError::ChunkIntegrity(s.clone()),
            FramegateError::CoalescingLimit => FramegateError::CoalescingLimit,
            FramegateError::Cancelled => FramegateError::Cancelled,
            FramegateError::RangeNotSatisfiable { total } => FramegateError::RangeNotSatisfiable {
                total: *total,
            },
            FramegateError::KvStorage(s) => FramegateError::KvStorage(s.clone()),
            FramegateError::Config(s) => FramegateError::Config(s.clone()),
            FramegateError::Internal(s) => FramegateError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for FramegateError {
    fn from(e: std::io::Error) -> Self {
        FramegateError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for FramegateError {
    fn from(e: reqwest::Error) -> Self {
        FramegateError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for FramegateError {
    fn from(e: serde_json::Error) -> Self {
        FramegateError::Internal(format!("JSON codec failure: {e}"))
    }
}
