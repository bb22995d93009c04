// tests/unit_imquery_test.rs

//! IMQuery hints collapse onto derivative cache keys.

mod helpers;

use bytes::Bytes;
use framegate::core::options::CacheKey;
use framegate::core::orchestrator::RequestMethod;
use framegate::core::storage::KvStore;
use helpers::{MockTransformer, serve, test_config, test_world};
use std::collections::HashMap;

#[tokio::test]
async fn nearby_imquery_widths_share_one_artifact() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let body = Bytes::from_static(b"tablet rendition bytes");
    let transformer = MockTransformer::new(body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let first = serve(
        &world,
        RequestMethod::Get,
        "/videos/resp.mp4",
        &[("imwidth", "800")],
        None,
    )
    .await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header_value("X-Cache"), Some("MISS"));
    assert_eq!(helpers::read_body(first).await, body.as_ref());

    // Both hints bucket onto the tablet derivative (1280x720).
    let key = CacheKey::from_raw("video:/videos/resp.mp4:derivative=tablet");
    let manifest = helpers::wait_for_manifest(&world, &key).await;
    assert_eq!(
        manifest.derivative_dims.map(|d| (d.width, d.height)),
        Some((1280, 720))
    );

    let second = serve(
        &world,
        RequestMethod::Get,
        "/videos/resp.mp4",
        &[("imwidth", "900")],
        None,
    )
    .await;
    assert_eq!(second.header_value("X-Cache"), Some("HIT"));
    assert_eq!(helpers::read_body(second).await, body.as_ref());

    // One transform, one manifest.
    assert_eq!(world.transformer.call_count(), 1);
    let manifests: Vec<String> = world
        .kv
        .list("video:")
        .await
        .unwrap()
        .into_iter()
        .filter(|candidate| !candidate.contains("_chunk_"))
        .collect();
    assert_eq!(manifests.len(), 1);
}

#[tokio::test]
async fn imquery_sends_derivative_dimensions_upstream() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"x"));
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let response = serve(
        &world,
        RequestMethod::Get,
        "/videos/resp.mp4",
        &[("imwidth", "855")],
        None,
    )
    .await;
    assert_eq!(response.status, 200);
    helpers::read_body(response).await;

    let requests = world.transformer.requests.lock();
    let opts = &requests[0].opts;
    assert_eq!(opts.derivative.as_deref(), Some("tablet"));
    assert_eq!(
        opts.effective_dims().map(|d| (d.width, d.height)),
        Some((1280, 720))
    );
}

#[tokio::test]
async fn imquery_hints_do_not_bypass_the_cache() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"cached"));
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let first = serve(
        &world,
        RequestMethod::Get,
        "/videos/resp.mp4",
        &[("imheight", "700")],
        None,
    )
    .await;
    helpers::read_body(first).await;
    let key = CacheKey::from_raw("video:/videos/resp.mp4:derivative=tablet");
    helpers::wait_for_manifest(&world, &key).await;

    let second = serve(
        &world,
        RequestMethod::Get,
        "/videos/resp.mp4",
        &[("imheight", "700")],
        None,
    )
    .await;
    assert_eq!(second.header_value("X-Cache"), Some("HIT"));
}
