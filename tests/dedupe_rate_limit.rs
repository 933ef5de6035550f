//! End-to-end behavior of the two built-in stages (spec §8 scenarios 1 &
//! 2): dedupe suppresses repeats of the same key within its window, and
//! rate-limit drops once its token bucket is drained.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use surveillance_core::bus::{Bus, Handler};
use surveillance_core::contracts::{
    ArtifactKind, BoundingBox, DetectionEvent, DetectionKind, Envelope, MediaArtifact, Payload, PublishMetadata, Topic,
};
use surveillance_core::orchestrator::Module;
use surveillance_core::stages::{DedupeModule, RateLimitModule};

struct CapturingHandler {
    tx: tokio::sync::mpsc::Sender<Arc<Envelope>>,
}

#[async_trait]
impl Handler for CapturingHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = self.tx.send(envelope).await;
        Ok(())
    }
}

fn detection(camera_id: &str, label: &str) -> DetectionEvent {
    DetectionEvent {
        camera_id: camera_id.into(),
        timestamp: chrono::Utc::now(),
        kind: DetectionKind::Motion,
        label: label.into(),
        confidence: 0.9,
        bbox: BoundingBox::default(),
        attributes: HashMap::new(),
    }
}

fn artifact(camera_id: &str, path: &str) -> MediaArtifact {
    MediaArtifact {
        kind: ArtifactKind::Snapshot,
        path_or_handle: path.into(),
        camera_id: camera_id.into(),
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn dedupe_suppresses_repeats_within_window_and_forwards_after() {
    let bus = Bus::spawn();
    let module = DedupeModule::new();
    module
        .configure(serde_json::json!({
            "window_seconds": 0.15,
            "key_attributes": ["camera_id", "kind", "label"],
            "lru_capacity": 4096,
            "source_topic": "process.motion.detected",
        }))
        .await
        .unwrap();
    module.start(bus.clone()).await.unwrap();

    let derived: Topic = "process.motion.unique".try_into().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    bus.subscribe_default(&derived, "test", Arc::new(CapturingHandler { tx })).await.unwrap();

    let source: Topic = "process.motion.detected".try_into().unwrap();

    bus.publish(&source, Payload::DetectionEvent(detection("front-door", "motion")), PublishMetadata::default())
        .await
        .unwrap();
    bus.publish(&source, Payload::DetectionEvent(detection("front-door", "motion")), PublishMetadata::default())
        .await
        .unwrap();

    let forwarded = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match &forwarded.payload {
        Payload::DetectionEvent(e) => assert_eq!(e.label, "motion"),
        _ => panic!("expected DetectionEvent"),
    }
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await.is_err(),
        "the second, same-key detection must be suppressed"
    );

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    bus.publish(&source, Payload::DetectionEvent(detection("front-door", "motion")), PublishMetadata::default())
        .await
        .unwrap();
    let forwarded = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match &forwarded.payload {
        Payload::DetectionEvent(e) => assert_eq!(e.label, "motion"),
        _ => panic!("expected DetectionEvent"),
    }

    module.stop().await.unwrap();
}

#[tokio::test]
async fn rate_limit_drops_once_the_bucket_is_drained() {
    let bus = Bus::spawn();
    let module = RateLimitModule::new();
    module
        .configure(serde_json::json!({
            "capacity": 2.0,
            "refill_per_second": 0.0,
            "key_attribute": "camera_id",
            "idle_eviction_seconds": 300,
            "source_topic": "event.snapshot.ready",
        }))
        .await
        .unwrap();
    module.start(bus.clone()).await.unwrap();

    let derived: Topic = "event.snapshot.allowed".try_into().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    bus.subscribe_default(&derived, "test", Arc::new(CapturingHandler { tx })).await.unwrap();

    let source: Topic = "event.snapshot.ready".try_into().unwrap();
    for path in ["a", "b", "c"] {
        bus.publish(&source, Payload::MediaArtifact(artifact("cam1", path)), PublishMetadata::default())
            .await
            .unwrap();
    }

    let mut allowed = Vec::new();
    for _ in 0..2 {
        let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match &envelope.payload {
            Payload::MediaArtifact(a) => allowed.push(a.path_or_handle.clone()),
            _ => panic!("expected MediaArtifact"),
        }
    }
    assert_eq!(allowed, vec!["a".to_string(), "b".to_string()]);

    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(150), rx.recv()).await.is_err(),
        "the third artifact must be dropped once the bucket is empty"
    );
    assert_eq!(module.dropped_totals().get("cam1").copied(), Some(1));

    module.stop().await.unwrap();
}
