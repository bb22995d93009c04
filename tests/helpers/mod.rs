// tests/helpers/mod.rs

//! Shared fixtures: a scripted transformer, an in-process origin server, and
//! state construction over the in-memory KV backend.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use framegate::config::{
    Config, KvBackendKind, OriginRuleConfig, SourceConfig, SourceKind, TtlByStatus,
};
use framegate::core::FramegateError;
use framegate::core::options::CacheKey;
use framegate::core::orchestrator::{
    self, MediaRequest, MediaResponse, RequestMethod, ResponseBody,
};
use framegate::core::state::ServerState;
use framegate::core::storage::{ArtifactManifest, MemoryKvStore};
use framegate::core::transformer::{TransformRequest, TransformSuccess, Transformer};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// One scripted transformer response.
pub enum Scripted {
    Success { content_type: String, body: Bytes },
    Error(FramegateError),
    /// Parks until the gate is notified, then succeeds. Used to hold a
    /// fingerprint in flight.
    WaitThenSuccess {
        gate: Arc<Notify>,
        content_type: String,
        body: Bytes,
    },
}

/// A transformer double that records every request and plays a script.
/// With an empty script it answers with the default body.
pub struct MockTransformer {
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<TransformRequest>>,
    script: Mutex<VecDeque<Scripted>>,
    default_body: Bytes,
}

impl MockTransformer {
    pub fn new(default_body: Bytes) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default_body,
        })
    }

    pub fn push(&self, scripted: Scripted) {
        self.script.lock().push_back(scripted);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn success(content_type: String, body: Bytes) -> TransformSuccess {
        TransformSuccess {
            content_type,
            content_length: Some(body.len() as u64),
            body: futures::stream::iter(
                body.chunks(64 * 1024)
                    .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                    .collect::<Vec<_>>(),
            )
            .boxed(),
        }
    }
}

#[async_trait]
impl Transformer for MockTransformer {
    async fn transform(
        &self,
        request: TransformRequest,
    ) -> Result<TransformSuccess, FramegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        match next {
            None => Ok(Self::success(
                "video/mp4".to_string(),
                self.default_body.clone(),
            )),
            Some(Scripted::Success { content_type, body }) => Ok(Self::success(content_type, body)),
            Some(Scripted::Error(e)) => Err(e),
            Some(Scripted::WaitThenSuccess {
                gate,
                content_type,
                body,
            }) => {
                gate.notified().await;
                Ok(Self::success(content_type, body))
            }
        }
    }
}

/// Spawns a tiny origin server answering fixed bodies by path.
/// Unknown paths answer 404.
pub async fn spawn_origin(responses: HashMap<String, (u16, Bytes)>) -> SocketAddr {
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::response::Response;

    let responses = Arc::new(responses);
    let app = axum::Router::new().fallback(move |request: Request| {
        let responses = Arc::clone(&responses);
        async move {
            match responses.get(request.uri().path()) {
                Some((status, body)) => Response::builder()
                    .status(*status)
                    .header("content-type", "video/mp4")
                    .header("content-length", body.len().to_string())
                    .body(Body::from(body.clone()))
                    .unwrap(),
                None => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap(),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A config with one `videos` rule backed by a single remote source.
pub fn test_config(origin_base: &str) -> Config {
    let mut config = Config::default();
    config.cache.kv_backend = KvBackendKind::Memory;
    config.rules = vec![OriginRuleConfig {
        name: "videos".into(),
        pattern: r"^/videos/(?P<path>.+)$".into(),
        process_path: true,
        ttl: TtlByStatus::default(),
        sources: vec![SourceConfig {
            kind: SourceKind::Remote,
            priority: 1,
            path_template: format!("{origin_base}/origin/{{path}}"),
            auth: None,
        }],
    }];
    config
}

pub struct TestWorld {
    pub state: Arc<ServerState>,
    pub transformer: Arc<MockTransformer>,
    pub kv: Arc<MemoryKvStore>,
}

/// Builds server state over the memory backend with the mock transformer.
pub fn test_world(config: Config, transformer: Arc<MockTransformer>) -> TestWorld {
    let kv = Arc::new(MemoryKvStore::new());
    let state =
        ServerState::initialize_with(config, kv.clone(), transformer.clone(), None).unwrap();
    TestWorld {
        state,
        transformer,
        kv,
    }
}

/// Resolves the rule for `path` and serves one request through the orchestrator.
pub async fn serve(
    world: &TestWorld,
    method: RequestMethod,
    path: &str,
    query: &[(&str, &str)],
    range: Option<&str>,
) -> MediaResponse {
    let rule = { world.state.rules.read().resolve(path) }.expect("a rule must match");
    let request = MediaRequest {
        method,
        path: path.to_string(),
        query_pairs: query
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        range: range.map(|value| value.to_string()),
        if_none_match: None,
    };
    orchestrator::serve(&world.state, request, rule).await
}

pub async fn serve_get(world: &TestWorld, path: &str, query: &[(&str, &str)]) -> MediaResponse {
    serve(world, RequestMethod::Get, path, query, None).await
}

/// Drains a response body into bytes. Panics on stream errors.
pub async fn read_body(response: MediaResponse) -> Vec<u8> {
    match response.body {
        ResponseBody::Empty => Vec::new(),
        ResponseBody::Stream(stream) => {
            let chunks: Vec<Bytes> = stream.try_collect().await.expect("body stream failed");
            let mut collected = Vec::new();
            for chunk in chunks {
                collected.extend_from_slice(&chunk);
            }
            collected
        }
    }
}

/// Waits until the background writer commits a manifest for `key`.
pub async fn wait_for_manifest(world: &TestWorld, key: &CacheKey) -> ArtifactManifest {
    for _ in 0..200 {
        if let Some(manifest) = world.state.store.load_manifest(key).await.unwrap() {
            return manifest;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("manifest for '{key}' never appeared");
}

/// Polls until no manifest exists, confirming a write was skipped or aborted.
pub async fn assert_no_manifest_settles(world: &TestWorld, key: &CacheKey) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        world
            .state
            .store
            .load_manifest(key)
            .await
            .unwrap()
            .is_none(),
        "unexpected manifest for '{key}'"
    );
}

/// A deterministic pseudo-random body: byte i = (i * 31 + seed) mod 251.
pub fn patterned_body(len: usize, seed: u8) -> Bytes {
    let mut body = Vec::with_capacity(len);
    for i in 0..len {
        body.push(((i.wrapping_mul(31) + seed as usize) % 251) as u8);
    }
    Bytes::from(body)
}
