// tests/unit_version_test.rs

//! Version invalidation: operator bumps roll the upstream fetch URL and
//! force a fresh artifact.

mod helpers;

use bytes::Bytes;
use framegate::core::options::{Fingerprint, TransformOptions};
use framegate::core::orchestrator::RequestMethod;
use framegate::core::storage::KvStore;
use helpers::{MockTransformer, Scripted, serve, test_config, test_world};
use std::collections::HashMap;

#[tokio::test]
async fn version_bump_refetches_and_rewrites_the_artifact() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let v1_body = Bytes::from_static(b"first rendition");
    let v2_body = Bytes::from_static(b"second rendition");
    let transformer = MockTransformer::new(v1_body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let fingerprint = Fingerprint::derive("/videos/v.mp4", &TransformOptions::default());
    let key = fingerprint.cache_key();

    // First fetch populates the artifact at version 1.
    let first = serve(&world, RequestMethod::Get, "/videos/v.mp4", &[], None).await;
    assert_eq!(helpers::read_body(first).await, v1_body.as_ref());
    let manifest = helpers::wait_for_manifest(&world, &key).await;
    assert_eq!(manifest.version, 1);

    let hit = serve(&world, RequestMethod::Get, "/videos/v.mp4", &[], None).await;
    assert_eq!(hit.header_value("X-Cache"), Some("HIT"));
    helpers::read_body(hit).await;
    assert_eq!(world.transformer.call_count(), 1);

    // Operator bumps the version.
    world.state.versions.set(&fingerprint, 2).await.unwrap();

    world.transformer.push(Scripted::Success {
        content_type: "video/mp4".into(),
        body: v2_body.clone(),
    });
    let refetched = serve(&world, RequestMethod::Get, "/videos/v.mp4", &[], None).await;
    assert_eq!(refetched.header_value("X-Cache"), Some("MISS"));
    assert_eq!(helpers::read_body(refetched).await, v2_body.as_ref());

    // The upstream URL carried v=2.
    assert_eq!(world.transformer.call_count(), 2);
    {
        let requests = world.transformer.requests.lock();
        assert_eq!(requests[1].opts.version, 2);
        let upstream = requests[1].opts.upstream_query_pairs();
        assert!(upstream.contains(&("v".to_string(), "2".to_string())));
    }

    // A fresh artifact is committed under the new version.
    for _ in 0..200 {
        let manifest = world.state.store.load_manifest(&key).await.unwrap();
        if manifest.as_ref().map(|m| m.version) == Some(2) {
            assert_eq!(
                manifest.unwrap().total_size,
                v2_body.len() as u64
            );
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("version 2 artifact never committed");
}

#[tokio::test]
async fn reads_never_inflate_versions() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"x"));
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let fingerprint = Fingerprint::derive("/videos/quiet.mp4", &TransformOptions::default());
    let response = serve(&world, RequestMethod::Get, "/videos/quiet.mp4", &[], None).await;
    helpers::read_body(response).await;

    // Serving a miss must not create a version record.
    assert!(
        world
            .kv
            .get(&fingerprint.version_key())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(world.state.versions.get(&fingerprint).await, 1);
}

#[tokio::test]
async fn deleting_a_version_returns_to_the_default() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"x"));
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let fingerprint = Fingerprint::derive("/videos/d.mp4", &TransformOptions::default());
    world.state.versions.set(&fingerprint, 9).await.unwrap();
    assert_eq!(world.state.versions.get(&fingerprint).await, 9);
    world.state.versions.delete(&fingerprint).await.unwrap();
    assert_eq!(world.state.versions.get(&fingerprint).await, 1);
}
