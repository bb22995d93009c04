// src/core/transformer/mod.rs

//! The client for the external media-transformation endpoint.
//!
//! One request, no retries: retry decisions belong to the orchestrator and
//! the fallback handler. Upstream failures are surfaced as distinct error
//! kinds so the decision table in `core::fallback` can act on them.

pub mod upstream_error;

use crate::config::TransformerConfig;
use crate::core::metrics;
use crate::core::options::TransformOptions;
use crate::core::FramegateError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use url::Url;

/// One transformation request: the rendered source URL plus canonical options
/// (already carrying the fingerprint's current version).
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub source_url: String,
    pub opts: TransformOptions,
}

/// A successful transformation: headers plus the streaming body. The body is
/// owned by exactly one consumer, the orchestrator's pump task.
pub struct TransformSuccess {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FramegateError>>,
}

/// The transformation endpoint contract.
#[async_trait]
pub trait Transformer: Send + Sync + 'static {
    async fn transform(&self, request: TransformRequest)
    -> Result<TransformSuccess, FramegateError>;
}

/// The production client speaking HTTP to the configured endpoint.
pub struct HttpTransformer {
    client: reqwest::Client,
    endpoint: Url,
    error_body_limit: usize,
}

impl HttpTransformer {
    pub fn new(settings: &TransformerConfig) -> Result<Self, FramegateError> {
        let endpoint = Url::parse(&settings.endpoint)
            .map_err(|e| FramegateError::Config(format!("invalid transformer endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| FramegateError::Config(format!("transformer client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            error_body_limit: settings.error_body_limit_bytes,
        })
    }

    /// The upstream fetch URL: endpoint + `source` + canonical option params.
    fn build_url(&self, request: &TransformRequest) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("source", &request.source_url);
            for (key, value) in request.opts.upstream_query_pairs() {
                query.append_pair(&key, &value);
            }
        }
        url
    }
}

#[async_trait]
impl Transformer for HttpTransformer {
    async fn transform(
        &self,
        request: TransformRequest,
    ) -> Result<TransformSuccess, FramegateError> {
        let url = self.build_url(&request);
        metrics::TRANSFORM_CALLS_TOTAL.inc();
        let timer = metrics::TRANSFORM_LATENCY_SECONDS.start_timer();

        let response = self.client.get(url).send().await?;
        timer.observe_duration();
        let status = response.status();

        if status.is_success() {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let content_length = response.content_length();
            let body = response
                .bytes_stream()
                .map_err(FramegateError::from)
                .boxed();
            return Ok(TransformSuccess {
                content_type,
                content_length,
                body,
            });
        }

        // Read a bounded prefix of the error body for classification.
        let mut collected = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.try_next().await.unwrap_or(None) {
            collected.extend_from_slice(&chunk);
            if collected.len() >= self.error_body_limit {
                collected.truncate(self.error_body_limit);
                break;
            }
        }
        let body_text = String::from_utf8_lossy(&collected).into_owned();

        let error = match status.as_u16() {
            400 => upstream_error::classify_bad_request(&body_text),
            404 => FramegateError::NotFound(format!(
                "transformer reported missing source '{}'",
                request.source_url
            )),
            413 => FramegateError::FileSizeLimit(body_text),
            415 => FramegateError::UnsupportedFormat(body_text),
            429 => FramegateError::RateLimit,
            code if code >= 500 => FramegateError::ServerError { status: code },
            _ => FramegateError::ParameterError(body_text),
        };
        metrics::TRANSFORM_ERRORS_TOTAL
            .with_label_values(&[error.error_type()])
            .inc();
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::options::TransformOptions;

    #[test]
    fn upstream_url_carries_source_options_and_version() {
        let transformer = HttpTransformer::new(&TransformerConfig {
            endpoint: "https://transform.example.com/media".into(),
            ..Default::default()
        })
        .unwrap();

        let mut opts = TransformOptions::from_query_pairs(
            &[
                ("width".to_string(), "640".to_string()),
                ("height".to_string(), "360".to_string()),
            ],
            &Config::default(),
        )
        .unwrap();
        opts.version = 2;

        let url = transformer.build_url(&TransformRequest {
            source_url: "https://media.example.com/v/a.mp4".into(),
            opts,
        });
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("source".into(), "https://media.example.com/v/a.mp4".into())));
        assert!(query.contains(&("width".into(), "640".into())));
        assert!(query.contains(&("v".into(), "2".into())));
    }
}
