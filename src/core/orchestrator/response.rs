// src/core/orchestrator/response.rs

//! Response assembly: the transport-agnostic `MediaResponse` plus the header
//! conventions shared by hits, misses, fallbacks, and errors.

use crate::core::FramegateError;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

/// A response body: empty (HEAD, 304, 416) or a byte stream.
pub enum ResponseBody {
    Empty,
    Stream(BoxStream<'static, Result<Bytes, FramegateError>>),
}

/// A transport-agnostic response; the HTTP layer converts it to axum types.
pub struct MediaResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl MediaResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn stream(mut self, body: BoxStream<'static, Result<Bytes, FramegateError>>) -> Self {
        self.body = ResponseBody::Stream(body);
        self
    }

    /// Drops the body, keeping entity headers. Used for HEAD.
    pub fn into_head(mut self) -> Self {
        self.body = ResponseBody::Empty;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// `Cache-Control` for a cacheable media response with the given TTL.
pub fn cache_control_value(ttl: Duration) -> String {
    format!("public, max-age={}", ttl.as_secs())
}

/// The status-specific diagnostic headers for an error kind.
pub fn diagnostic_headers(error: &FramegateError) -> Vec<(String, String)> {
    match error {
        FramegateError::FileSizeLimit(_) => vec![
            ("X-File-Size-Error".to_string(), "true".to_string()),
            ("X-Video-Too-Large".to_string(), "true".to_string()),
        ],
        FramegateError::RateLimit => vec![(
            "X-Rate-Limit-Exceeded".to_string(),
            "true".to_string(),
        )],
        FramegateError::ServerError { .. } => {
            vec![("X-Server-Error".to_string(), "true".to_string())]
        }
        _ => Vec::new(),
    }
}

/// An error surfaced directly to the caller, with the taxonomy headers.
pub fn error_response(error: &FramegateError) -> MediaResponse {
    let status = error.http_status();
    let mut response = MediaResponse::new(status)
        .header("X-Error-Status", status.to_string())
        .header("X-Error-Type", error.error_type())
        .header("Cache-Control", "no-store")
        .headers(diagnostic_headers(error));
    if matches!(error, FramegateError::CoalescingLimit) {
        response = response.header("Retry-After", "1");
    }
    response
}

/// A 304 for a matching `If-None-Match`.
pub fn not_modified(etag: &str, cache_control: String) -> MediaResponse {
    MediaResponse::new(304)
        .header("ETag", etag)
        .header("Cache-Control", cache_control)
        .header("X-Cache", "HIT")
}

/// A 416 with the mandated `Content-Range: bytes */total`.
pub fn range_not_satisfiable(total: u64) -> MediaResponse {
    MediaResponse::new(416)
        .header("Content-Range", format!("bytes */{total}"))
        .header("Accept-Ranges", "bytes")
}
