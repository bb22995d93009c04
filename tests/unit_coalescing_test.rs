// tests/unit_coalescing_test.rs

//! Request coalescing: concurrent identical misses share one transformation.

mod helpers;

use bytes::Bytes;
use framegate::core::options::{Fingerprint, TransformOptions};
use framegate::core::orchestrator::RequestMethod;
use framegate::core::storage::KvStore;
use helpers::{MockTransformer, Scripted, serve, test_config, test_world};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_requests_invoke_one_transformation() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let body = helpers::patterned_body(512 * 1024, 7);
    let transformer = MockTransformer::new(body.clone());
    let gate = Arc::new(Notify::new());
    transformer.push(Scripted::WaitThenSuccess {
        gate: Arc::clone(&gate),
        content_type: "video/mp4".into(),
        body: body.clone(),
    });
    let world = Arc::new(test_world(
        test_config(&format!("http://{origin}")),
        transformer,
    ));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let world = Arc::clone(&world);
        handles.push(tokio::spawn(async move {
            let response = serve(
                &world,
                RequestMethod::Get,
                "/videos/a.mp4",
                &[("width", "640"), ("height", "360"), ("mode", "video")],
                None,
            )
            .await;
            let status = response.status;
            (status, helpers::read_body(response).await)
        }));
    }

    // Give every request time to join the in-flight entry, then release the
    // single upstream call. `notify_one` stores a permit, so the release
    // cannot be lost if the initiator has not reached the gate yet.
    tokio::time::sleep(Duration::from_millis(300)).await;
    gate.notify_one();

    for handle in handles {
        let (status, collected) = handle.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(collected, body.as_ref());
    }

    assert_eq!(world.transformer.call_count(), 1);

    // Exactly one manifest is committed afterwards.
    let mut opts = TransformOptions::default();
    opts.width = Some(640);
    opts.height = Some(360);
    let key = Fingerprint::derive("/videos/a.mp4", &opts).cache_key();
    let manifest = helpers::wait_for_manifest(&world, &key).await;
    assert_eq!(manifest.total_size, body.len() as u64);

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
async fn joiners_share_the_initiator_body_and_the_entry_drains() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"shared"));
    let gate = Arc::new(Notify::new());
    transformer.push(Scripted::WaitThenSuccess {
        gate: Arc::clone(&gate),
        content_type: "video/mp4".into(),
        body: Bytes::from_static(b"shared"),
    });
    let world = Arc::new(test_world(
        test_config(&format!("http://{origin}")),
        transformer,
    ));

    let first = {
        let world = Arc::clone(&world);
        tokio::spawn(async move {
            let response = serve(&world, RequestMethod::Get, "/videos/b.mp4", &[], None).await;
            helpers::read_body(response).await
        })
    };
    // Let the initiator claim the in-flight slot before the joiner arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(world.state.cache.in_flight.len(), 1);

    let second = {
        let world = Arc::clone(&world);
        tokio::spawn(async move {
            let response = serve(&world, RequestMethod::Get, "/videos/b.mp4", &[], None).await;
            helpers::read_body(response).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();

    assert_eq!(first.await.unwrap(), b"shared");
    assert_eq!(second.await.unwrap(), b"shared");
    assert_eq!(world.transformer.call_count(), 1);

    // The entry is removed once the last consumer finishes.
    for _ in 0..100 {
        if world.state.cache.in_flight.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(world.state.cache.in_flight.is_empty());
}

#[tokio::test]
async fn admission_cap_rejects_new_fingerprints_with_retry_after() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::from_static(b"x"));
    let gate = Arc::new(Notify::new());
    transformer.push(Scripted::WaitThenSuccess {
        gate: Arc::clone(&gate),
        content_type: "video/mp4".into(),
        body: Bytes::from_static(b"x"),
    });

    let mut config = test_config(&format!("http://{origin}"));
    config.cache.max_in_flight = 1;
    let world = Arc::new(test_world(config, transformer));

    let held = {
        let world = Arc::clone(&world);
        tokio::spawn(async move {
            let response = serve(&world, RequestMethod::Get, "/videos/held.mp4", &[], None).await;
            helpers::read_body(response).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = serve(&world, RequestMethod::Get, "/videos/other.mp4", &[], None).await;
    assert_eq!(rejected.status, 503);
    assert_eq!(rejected.header_value("Retry-After"), Some("1"));
    assert_eq!(rejected.header_value("X-Error-Type"), Some("server_error"));

    gate.notify_one();
    held.await.unwrap();
}
