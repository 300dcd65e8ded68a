//! Integration Tests for the NATS task queue
//!
//! These tests require a NATS server with JetStream enabled on
//! localhost:4222. Each test uses its own stream and subject prefix.

use cinecore_config::MessageBusConfig;
use cinecore_types::{
    EncodingStatus, Event, EventType, Lane, MediaEncodedPayload, MediaId, MediaProfilePair, MediaTaskArgs, RevokeRequest,
    TaskEnvelope, TaskName, PRIORITY_HIGH,
};
use futures::StreamExt;
use std::time::Duration;
use task_queue_client::{NatsTaskQueue, TaskQueue};
use uuid::Uuid;

fn isolated_config() -> MessageBusConfig {
    let tag = Uuid::new_v4().simple().to_string();
    MessageBusConfig {
        url: "nats://localhost:4222".to_string(),
        stream_name: format!("TEST_{}", tag.to_uppercase()),
        subject_prefix: format!("test-{}", &tag[..8]),
        registry_bucket: format!("test-registry-{}", &tag[..8]),
    }
}

async fn connect() -> NatsTaskQueue {
    NatsTaskQueue::new(&isolated_config(), Duration::from_secs(30))
        .await
        .expect("Failed to connect to NATS")
}

fn encode_task(media: &str, profile: i32) -> TaskEnvelope {
    TaskEnvelope::new(
        TaskName::EncodeMedia,
        MediaTaskArgs {
            media_id: MediaId::from(media),
        },
    )
    .expect("Failed to build task")
    .with_correlation(MediaId::from(media), profile)
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_enqueue_consume_ack() {
    let queue = connect().await;
    assert!(queue.is_connected().await);

    let task = encode_task("m1", 3);
    let task_id = queue.enqueue(task.clone()).await.expect("Failed to enqueue");
    assert_eq!(task_id, task.task_id);

    let snapshot = queue.inspect().await.expect("Failed to inspect");
    assert!(snapshot.contains_task(&task_id));
    assert!(snapshot.contains_pair(&MediaProfilePair::new(MediaId::from("m1"), 3)));

    let mut deliveries = queue.consume(Lane::Long);
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery failed");
    assert_eq!(delivery.task.task_id, task_id);
    delivery.ack().await.expect("Failed to ack");

    let snapshot = queue.inspect().await.expect("Failed to inspect");
    assert!(!snapshot.contains_task(&task_id));
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_high_priority_delivered_first() {
    let queue = connect().await;

    let normal = encode_task("m1", 4);
    let urgent = encode_task("m1", 1).with_priority(PRIORITY_HIGH);
    queue.enqueue(normal.clone()).await.expect("Failed to enqueue");
    queue.enqueue(urgent.clone()).await.expect("Failed to enqueue");

    let mut deliveries = queue.consume(Lane::Long);
    let first = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery failed");
    assert_eq!(first.task.task_id, urgent.task_id);
    first.ack().await.expect("Failed to ack");
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_revocation_is_broadcast() {
    let queue = connect().await;
    let task = encode_task("m2", 2);
    queue.enqueue(task.clone()).await.expect("Failed to enqueue");

    let mut revocations = queue.revocations();
    // give the subscription time to register
    tokio::time::sleep(Duration::from_millis(200)).await;

    queue
        .revoke(RevokeRequest {
            task_id: task.task_id.clone(),
            temp_file: None,
        })
        .await
        .expect("Failed to revoke");

    let received = tokio::time::timeout(Duration::from_secs(5), revocations.next())
        .await
        .expect("Timeout waiting for revocation")
        .expect("Stream ended")
        .expect("Revocation failed");
    assert_eq!(received.task_id, task.task_id);

    let snapshot = queue.inspect().await.expect("Failed to inspect");
    assert!(!snapshot.contains_task(&task.task_id));
}

#[tokio::test]
#[ignore] // Requires NATS server
async fn test_event_publish() {
    let queue = connect().await;
    let event = Event::new(
        EventType::MediaEncoded,
        "test",
        MediaEncodedPayload {
            media_id: MediaId::from("m1"),
            status: EncodingStatus::Success,
            profiles: vec![1, 2],
            hls_file: None,
        },
    )
    .expect("Failed to create event");
    queue.publish_event(&event).await.expect("Failed to publish");
}
