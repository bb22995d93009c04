// tests/unit_bypass_test.rs

//! Bypass tokens: cache is neither read nor written, and no coalescing occurs.

mod helpers;

use bytes::Bytes;
use framegate::core::options::{Fingerprint, TransformOptions};
use framegate::core::orchestrator::RequestMethod;
use helpers::{MockTransformer, serve, test_config, test_world};
use std::collections::HashMap;

#[tokio::test]
async fn bypass_token_skips_read_and_write() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let body = Bytes::from_static(b"fresh bytes every time");
    let transformer = MockTransformer::new(body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let key = Fingerprint::derive("/videos/raw.mp4", &TransformOptions::default()).cache_key();

    let first = serve(
        &world,
        RequestMethod::Get,
        "/videos/raw.mp4",
        &[("nocache", "1")],
        None,
    )
    .await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header_value("X-Cache"), Some("BYPASS"));
    assert_eq!(first.header_value("Cache-Control"), Some("no-store"));
    assert_eq!(helpers::read_body(first).await, body.as_ref());

    let second = serve(
        &world,
        RequestMethod::Get,
        "/videos/raw.mp4",
        &[("bypass", "")],
        None,
    )
    .await;
    assert_eq!(second.header_value("X-Cache"), Some("BYPASS"));
    helpers::read_body(second).await;

    // Two bypassed requests, two upstream calls, nothing persisted.
    assert_eq!(world.transformer.call_count(), 2);
    helpers::assert_no_manifest_settles(&world, &key).await;
}

#[tokio::test]
async fn bypass_ignores_an_existing_artifact() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let cached_body = Bytes::from_static(b"cached rendition");
    let transformer = MockTransformer::new(cached_body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    // Populate the cache.
    let miss = serve(&world, RequestMethod::Get, "/videos/c.mp4", &[], None).await;
    helpers::read_body(miss).await;
    let key = Fingerprint::derive("/videos/c.mp4", &TransformOptions::default()).cache_key();
    helpers::wait_for_manifest(&world, &key).await;

    // A bypass request still goes upstream.
    let bypassed = serve(
        &world,
        RequestMethod::Get,
        "/videos/c.mp4",
        &[("debug", "headers")],
        None,
    )
    .await;
    assert_eq!(bypassed.header_value("X-Cache"), Some("BYPASS"));
    helpers::read_body(bypassed).await;
    assert_eq!(world.transformer.call_count(), 2);
}

#[tokio::test]
async fn head_requests_mirror_get_headers_without_a_body() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let body = helpers::patterned_body(2048, 1);
    let transformer = MockTransformer::new(body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let miss = serve(&world, RequestMethod::Get, "/videos/h.mp4", &[], None).await;
    helpers::read_body(miss).await;
    let key = Fingerprint::derive("/videos/h.mp4", &TransformOptions::default()).cache_key();
    helpers::wait_for_manifest(&world, &key).await;

    let head = serve(&world, RequestMethod::Head, "/videos/h.mp4", &[], None).await;
    assert_eq!(head.status, 200);
    assert_eq!(head.header_value("X-Cache"), Some("HIT"));
    assert_eq!(head.header_value("Content-Length"), Some("2048"));
    assert_eq!(
        head.header_value("Accept-Ranges"),
        Some("bytes")
    );
    assert!(helpers::read_body(head).await.is_empty());
}

#[tokio::test]
async fn conditional_requests_revalidate_against_the_manifest_etag() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"etag body"));
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let miss = serve(&world, RequestMethod::Get, "/videos/e.mp4", &[], None).await;
    helpers::read_body(miss).await;
    let key = Fingerprint::derive("/videos/e.mp4", &TransformOptions::default()).cache_key();
    let manifest = helpers::wait_for_manifest(&world, &key).await;

    let request = framegate::core::orchestrator::MediaRequest {
        method: RequestMethod::Get,
        path: "/videos/e.mp4".into(),
        query_pairs: vec![],
        range: None,
        if_none_match: Some(manifest.etag.clone()),
    };
    let rule = { world.state.rules.read().resolve("/videos/e.mp4") }.unwrap();
    let response = framegate::core::orchestrator::serve(&world.state, request, rule).await;
    assert_eq!(response.status, 304);
    assert_eq!(response.header_value("ETag"), Some(manifest.etag.as_str()));
    assert!(helpers::read_body(response).await.is_empty());
}
