// tests/unit_gc_test.rs

//! Garbage collection: expired manifests and the two-sweep orphan policy.

mod helpers;

use bytes::Bytes;
use framegate::core::options::CacheKey;
use framegate::core::orchestrator::RequestMethod;
use framegate::core::storage::KvStore;
use framegate::core::tasks::chunk_gc::ChunkGcTask;
use helpers::{MockTransformer, serve, test_config, test_world};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn expired_manifests_are_collected_with_their_chunks() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(helpers::patterned_body(4096, 3));
    let mut config = test_config(&format!("http://{origin}"));
    // Everything cached through this rule expires almost immediately.
    config.rules[0].ttl.ok = Duration::from_millis(50);
    let world = test_world(config, transformer);

    let miss = serve(&world, RequestMethod::Get, "/videos/stale.mp4", &[], None).await;
    helpers::read_body(miss).await;
    let key = CacheKey::from_raw("video:/videos/stale.mp4:w=-:h=-:m=video");
    helpers::wait_for_manifest(&world, &key).await;
    assert!(world.kv.get(key.as_str()).await.unwrap().is_some());
    assert!(world.kv.get(&key.chunk_key(0)).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut gc = ChunkGcTask::new(Arc::clone(&world.state));
    gc.sweep().await.unwrap();

    assert!(world.kv.get(key.as_str()).await.unwrap().is_none());
    assert!(world.kv.get(&key.chunk_key(0)).await.unwrap().is_none());
}

#[tokio::test]
async fn orphan_chunks_need_two_sweeps() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let transformer = MockTransformer::new(Bytes::new());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    // A chunk with no manifest, as an aborted write leaves behind.
    let orphan_key = "video:/videos/gone.mp4:w=-:h=-:m=video_chunk_0";
    world
        .kv
        .put(orphan_key, Bytes::from_static(b"leftover"))
        .await
        .unwrap();

    let mut gc = ChunkGcTask::new(Arc::clone(&world.state));

    // First sweep only marks the candidate: an in-progress write must not
    // lose chunks it has not yet committed.
    gc.sweep().await.unwrap();
    assert!(world.kv.get(orphan_key).await.unwrap().is_some());

    gc.sweep().await.unwrap();
    assert!(world.kv.get(orphan_key).await.unwrap().is_none());
}

#[tokio::test]
async fn live_artifacts_survive_sweeps() {
    let origin = helpers::spawn_origin(HashMap::new()).await;
    let body = helpers::patterned_body(2048, 7);
    let transformer = MockTransformer::new(body.clone());
    let world = test_world(test_config(&format!("http://{origin}")), transformer);

    let miss = serve(&world, RequestMethod::Get, "/videos/live.mp4", &[], None).await;
    helpers::read_body(miss).await;
    let key = CacheKey::from_raw("video:/videos/live.mp4:w=-:h=-:m=video");
    helpers::wait_for_manifest(&world, &key).await;

    let mut gc = ChunkGcTask::new(Arc::clone(&world.state));
    gc.sweep().await.unwrap();
    gc.sweep().await.unwrap();

    let hit = serve(&world, RequestMethod::Get, "/videos/live.mp4", &[], None).await;
    assert_eq!(hit.header_value("X-Cache"), Some("HIT"));
    assert_eq!(helpers::read_body(hit).await, body.as_ref());
}
