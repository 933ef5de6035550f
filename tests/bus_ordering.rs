//! Bus delivery-order and overflow-policy behavior (spec §4.2): each
//! subscription is served by exactly one consumer task, so deliveries to
//! that subscription preserve publish order, and the three overflow
//! policies (`block`, `drop_newest`, `drop_oldest`) behave as documented
//! when a slow handler lets the queue back up.

use std::sync::Arc;

use async_trait::async_trait;
use surveillance_core::bus::{Bus, Handler, OverflowPolicy};
use surveillance_core::contracts::{ControlCommand, Envelope, Payload, PublishMetadata, Topic};
use tokio::sync::{mpsc, Notify, Semaphore};

struct GatedHandler {
    sem: Arc<Semaphore>,
    started: Arc<Notify>,
    tx: mpsc::Sender<u64>,
}

#[async_trait]
impl Handler for GatedHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.started.notify_one();
        let _permit = self.sem.acquire().await.expect("semaphore never closed");
        let _ = self.tx.send(envelope.sequence).await;
        Ok(())
    }
}

struct CapturingHandler {
    tx: mpsc::Sender<u64>,
}

#[async_trait]
impl Handler for CapturingHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = self.tx.send(envelope.sequence).await;
        Ok(())
    }
}

fn probe_payload(n: u32) -> Payload {
    Payload::ControlCommand(ControlCommand {
        command: format!("probe-{n}"),
        target_module: None,
        arguments: Default::default(),
    })
}

#[tokio::test]
async fn deliveries_preserve_publish_order() {
    let bus = Bus::spawn();
    let topic: Topic = "event.bus.probe".try_into().unwrap();
    let (tx, mut rx) = mpsc::channel(32);
    bus.subscribe_default(&topic, "order-test", Arc::new(CapturingHandler { tx }))
        .await
        .unwrap();

    let mut published = Vec::new();
    for n in 0..20 {
        let seq = bus.publish(&topic, probe_payload(n), PublishMetadata::default()).await.unwrap();
        published.push(seq);
    }

    let mut received = Vec::new();
    for _ in 0..20 {
        received.push(tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap());
    }

    assert_eq!(received, published, "single consumer task must deliver in publish order");
}

#[tokio::test]
async fn drop_newest_discards_the_incoming_message_when_full() {
    let bus = Bus::spawn();
    let topic: Topic = "event.bus.probe".try_into().unwrap();
    let sem = Arc::new(Semaphore::new(0));
    let started = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::channel(32);
    bus.subscribe(
        &topic,
        "drop-newest-test",
        Arc::new(GatedHandler { sem: sem.clone(), started: started.clone(), tx }),
        1,
        OverflowPolicy::DropNewest,
        None,
    )
    .await
    .unwrap();

    let seq_a = bus.publish(&topic, probe_payload(1), PublishMetadata::default()).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), started.notified()).await.unwrap();

    let seq_b = bus.publish(&topic, probe_payload(2), PublishMetadata::default()).await.unwrap();
    let _seq_c = bus.publish(&topic, probe_payload(3), PublishMetadata::default()).await.unwrap();

    sem.add_permits(4);

    let first = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, seq_a);
    assert_eq!(second, seq_b, "the message already queued survives; the newer one is dropped");

    let third = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
    assert!(third.is_err(), "no third delivery should ever arrive");
}

#[tokio::test]
async fn drop_oldest_evicts_the_queued_message_for_the_incoming_one() {
    let bus = Bus::spawn();
    let topic: Topic = "event.bus.probe".try_into().unwrap();
    let sem = Arc::new(Semaphore::new(0));
    let started = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::channel(32);
    bus.subscribe(
        &topic,
        "drop-oldest-test",
        Arc::new(GatedHandler { sem: sem.clone(), started: started.clone(), tx }),
        1,
        OverflowPolicy::DropOldest,
        None,
    )
    .await
    .unwrap();

    let seq_a = bus.publish(&topic, probe_payload(1), PublishMetadata::default()).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), started.notified()).await.unwrap();

    let _seq_b = bus.publish(&topic, probe_payload(2), PublishMetadata::default()).await.unwrap();
    let seq_c = bus.publish(&topic, probe_payload(3), PublishMetadata::default()).await.unwrap();

    sem.add_permits(4);

    let first = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, seq_a);
    assert_eq!(second, seq_c, "the queued message is evicted in favor of the newer one");
}

#[tokio::test]
async fn block_policy_times_out_and_drops_past_the_publish_deadline() {
    let bus = Bus::spawn_with(
        std::time::Duration::from_millis(100),
        surveillance_core::bus::DEFAULT_HANDLER_DEADLINE,
        std::time::Duration::from_secs(3600),
    );
    let topic: Topic = "event.bus.probe".try_into().unwrap();
    let sem = Arc::new(Semaphore::new(0));
    let started = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::channel(32);
    bus.subscribe(
        &topic,
        "block-test",
        Arc::new(GatedHandler { sem: sem.clone(), started: started.clone(), tx }),
        1,
        OverflowPolicy::Block,
        None,
    )
    .await
    .unwrap();

    let seq_a = bus.publish(&topic, probe_payload(1), PublishMetadata::default()).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), started.notified()).await.unwrap();

    let seq_b = bus.publish(&topic, probe_payload(2), PublishMetadata::default()).await.unwrap();
    // Queue is now full (capacity 1); this publish blocks for up to the
    // 100ms publish deadline before the enqueue gives up.
    let started_at = tokio::time::Instant::now();
    let _seq_c = bus.publish(&topic, probe_payload(3), PublishMetadata::default()).await.unwrap();
    assert!(started_at.elapsed() >= std::time::Duration::from_millis(90));

    sem.add_permits(4);

    let first = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, seq_a);
    assert_eq!(second, seq_b);

    let third = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
    assert!(third.is_err(), "the message that timed out waiting for room is never delivered");
}
