// src/server/http.rs

//! The media-serving surface: the dispatcher owning every request path.
//!
//! Extracts options and IMQuery hints, resolves the origin rule, and hands
//! processing requests to the orchestrator. Unmatched (or non-processing)
//! paths are forwarded to the pass-through origin unchanged.

use crate::core::options::{self, Fingerprint, TransformOptions};
use crate::core::orchestrator::{self, MediaRequest, MediaResponse, RequestMethod, ResponseBody};
use crate::core::state::ServerState;
use crate::core::FramegateError;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The media router: one fallback handler owning all paths.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new().fallback(handle_media).with_state(state)
}

fn header_str(request: &Request, name: header::HeaderName) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

async fn handle_media(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let method = match *request.method() {
        Method::GET => RequestMethod::Get,
        Method::HEAD => RequestMethod::Head,
        _ => {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, "GET, HEAD")
                .body(Body::empty())
                .unwrap_or_default();
        }
    };

    let path = request.uri().path().to_string();
    let query_pairs: Vec<(String, String)> = request
        .uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let media_request = MediaRequest {
        method,
        path: path.clone(),
        query_pairs,
        range: header_str(&request, header::RANGE),
        if_none_match: header_str(&request, header::IF_NONE_MATCH),
    };

    // The rule registry read guard must not be held across await points.
    let matched = { state.rules.read().resolve(&path) };

    if options::wants_debug_view(&media_request.query_pairs) {
        return debug_view(&state, &media_request, matched.as_ref()).await;
    }

    match matched {
        Some(rule) if rule.process_path => {
            let request_id = Uuid::new_v4();
            debug!(%request_id, %path, rule = %rule.rule_name, "dispatching to orchestrator");
            let response = orchestrator::serve(&state, media_request, rule).await;
            into_axum(response, request_id)
        }
        _ => pass_through(&state, request).await,
    }
}

/// Converts the transport-agnostic response into an axum one.
fn into_axum(response: MediaResponse, request_id: Uuid) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    builder = builder.header("X-Request-Id", request_id.to_string());

    let body = match response.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Stream(stream) => Body::from_stream(
            stream.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        ),
    };
    builder.body(body).unwrap_or_else(|e| {
        warn!("response assembly failed: {e}");
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap_or_default()
    })
}

/// Forwards a request no rule claims to the pass-through origin unchanged.
async fn pass_through(state: &Arc<ServerState>, request: Request) -> Response {
    state.stats.increment_pass_through();
    let base = { state.config.lock().await.pass_through_base.clone() };
    let Some(base) = base else {
        return into_axum(
            orchestrator::response::error_response(&FramegateError::NotFound(
                "no origin rule matches this path".into(),
            )),
            Uuid::new_v4(),
        );
    };

    let mut target = format!("{}{}", base.trim_end_matches('/'), request.uri().path());
    if let Some(query) = request.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    let mut upstream = state.http_client.get(&target);
    if let Some(range) = request
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
    {
        upstream = upstream.header(header::RANGE, range);
    }

    match upstream.send().await {
        Ok(origin) => {
            let status = origin.status();
            let mut builder = Response::builder().status(status.as_u16());
            for name in [
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::CONTENT_RANGE,
                header::ACCEPT_RANGES,
                header::ETAG,
                header::CACHE_CONTROL,
            ] {
                if let Some(value) = origin.headers().get(&name) {
                    builder = builder.header(name, value);
                }
            }
            let body = Body::from_stream(
                origin
                    .bytes_stream()
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            );
            builder.body(body).unwrap_or_default()
        }
        Err(e) => {
            warn!(target = %target, "pass-through fetch failed: {e}");
            into_axum(
                orchestrator::response::error_response(&FramegateError::HttpClient(e.to_string())),
                Uuid::new_v4(),
            )
        }
    }
}

/// The `?debug=view` diagnostics page. Never cached.
async fn debug_view(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: Option<&crate::core::rules::RuleMatch>,
) -> Response {
    let parsed = {
        let config = state.config.lock().await;
        TransformOptions::from_query_pairs(&request.query_pairs, &config)
    };

    let mut rows: Vec<(String, String)> = vec![("path".into(), request.path.clone())];
    match &rule {
        Some(matched) => {
            rows.push(("rule".into(), matched.rule_name.clone()));
            rows.push(("process_path".into(), matched.process_path.to_string()));
            for source in &matched.sources {
                rows.push((
                    format!("source[{}]", source.priority),
                    format!("{} {}", source.kind.as_str(), source.url),
                ));
            }
        }
        None => rows.push(("rule".into(), "(no match)".into())),
    }

    match &parsed {
        Ok(opts) => {
            let fingerprint = Fingerprint::derive(&request.path, opts);
            let version = state.versions.get(&fingerprint).await;
            let cached = state
                .store
                .load_manifest(&fingerprint.cache_key())
                .await
                .ok()
                .flatten();
            rows.push(("mode".into(), opts.mode.to_string()));
            if let Some(dims) = opts.effective_dims() {
                rows.push(("dimensions".into(), format!("{}x{}", dims.width, dims.height)));
            }
            if let Some(derivative) = &opts.derivative {
                rows.push(("derivative".into(), derivative.clone()));
            }
            rows.push(("fingerprint".into(), fingerprint.to_string()));
            rows.push(("version".into(), version.to_string()));
            rows.push((
                "cached".into(),
                match &cached {
                    Some(manifest) => format!(
                        "yes ({} bytes in {} chunks)",
                        manifest.total_size, manifest.chunk_count
                    ),
                    None => "no".into(),
                },
            ));
        }
        Err(e) => rows.push(("options".into(), format!("invalid: {e}"))),
    }

    let mut html = String::from(
        "<!doctype html><html><head><title>framegate diagnostics</title></head><body>\
         <h1>framegate diagnostics</h1><table border=\"1\" cellpadding=\"4\">",
    );
    for (key, value) in rows {
        html.push_str(&format!(
            "<tr><th align=\"left\">{}</th><td>{}</td></tr>",
            escape(&key),
            escape(&value)
        ));
    }
    html.push_str("</table></body></html>");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .header("X-Cache", "BYPASS")
        .body(Body::from(html))
        .unwrap_or_default()
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
