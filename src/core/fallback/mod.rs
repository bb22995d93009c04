// src/core/fallback/mod.rs

//! Origin streaming for requests the transformer could not serve.
//!
//! The decision table (retry, which status falls back, what gets cached)
//! lives in the orchestrator; this module walks the source priority chain,
//! fetches origin bytes, and stamps the diagnostic headers every fallback
//! response must carry.

use crate::config::SourceAuth;
use crate::core::rules::ResolvedSource;
use crate::core::FramegateError;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

/// A successfully opened origin stream.
pub struct OriginResponse {
    pub source_kind: &'static str,
    pub source_url: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FramegateError>>,
}

/// Fetches origin bytes through the source priority chain.
pub struct OriginFetcher {
    client: reqwest::Client,
}

impl OriginFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Opens one source. Non-success statuses surface as errors so the chain
    /// walk can decide whether to continue.
    pub async fn fetch(&self, source: &ResolvedSource) -> Result<OriginResponse, FramegateError> {
        let mut request = self.client.get(&source.url);
        match &source.auth {
            Some(SourceAuth::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(SourceAuth::Header { name, value }) => {
                request = request.header(name.as_str(), value.as_str());
            }
            None => {}
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FramegateError::NotFound(format!(
                "source '{}' has no such object",
                source.url
            )));
        }
        if !status.is_success() {
            return Err(FramegateError::HttpClient(format!(
                "source '{}' responded with status {status}",
                source.url
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = response.content_length();
        Ok(OriginResponse {
            source_kind: source.kind.as_str(),
            source_url: source.url.clone(),
            content_type,
            content_length,
            body: response
                .bytes_stream()
                .map_err(FramegateError::from)
                .boxed(),
        })
    }

    /// Walks the chain in priority order: a 404 moves on to the next source
    /// and is never retried; other failures are remembered but the walk
    /// continues. With no source left the most meaningful error surfaces.
    pub async fn fetch_chain(
        &self,
        sources: &[ResolvedSource],
    ) -> Result<OriginResponse, FramegateError> {
        let mut last_error: Option<FramegateError> = None;
        for source in sources {
            match self.fetch(source).await {
                Ok(response) => {
                    debug!(url = %source.url, kind = source.kind.as_str(), "origin source selected");
                    return Ok(response);
                }
                Err(FramegateError::NotFound(reason)) => {
                    debug!(url = %source.url, "source 404, trying next: {reason}");
                    // Prefer a more specific failure over not_found when one occurred.
                    last_error.get_or_insert(FramegateError::NotFound(reason));
                }
                Err(e) => {
                    warn!(url = %source.url, "source fetch failed, trying next: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| FramegateError::NotFound("no sources configured".into())))
    }
}

/// The headers every fallback response must carry, plus the status-specific
/// diagnostics for the triggering error.
pub fn fallback_headers(error: &FramegateError) -> Vec<(String, String)> {
    let mut headers = vec![
        ("X-Fallback-Applied".to_string(), "true".to_string()),
        ("X-Bypass-Cache-API".to_string(), "true".to_string()),
        ("Accept-Ranges".to_string(), "bytes".to_string()),
        ("Cache-Control".to_string(), "no-store".to_string()),
    ];
    match error {
        FramegateError::FileSizeLimit(_) => {
            headers.push(("X-File-Size-Error".to_string(), "true".to_string()));
            headers.push(("X-Video-Too-Large".to_string(), "true".to_string()));
        }
        FramegateError::RateLimit => {
            headers.push(("X-Rate-Limit-Exceeded".to_string(), "true".to_string()));
        }
        FramegateError::ServerError { .. } => {
            headers.push(("X-Server-Error".to_string(), "true".to_string()));
        }
        _ => {}
    }
    headers
}
