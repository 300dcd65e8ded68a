//! NATS Task Queue Tests
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use cinecore_config::MessageBusConfig;
use cinecore_types::{Event, EventType, Lane, MediaId, MediaTaskArgs, MediaTranscribedPayload, RevokeRequest, TaskEnvelope, TaskName};
use futures::StreamExt;
use std::time::Duration;
use task_queue_client::nats::NatsTaskQueue;
use task_queue_client::traits::{TaskQueue, TaskState};

fn test_config() -> MessageBusConfig {
    MessageBusConfig {
        url: "nats://localhost:4222".to_string(),
        stream_name: format!("CINECORE_TEST_{}", uuid::Uuid::new_v4().simple()),
        subject_prefix: format!("cinecore-test-{}", uuid::Uuid::new_v4().simple()),
        registry_bucket: format!("cinecore-test-{}", uuid::Uuid::new_v4().simple()),
    }
}

fn media_task(name: TaskName) -> TaskEnvelope {
    TaskEnvelope::new(
        name,
        MediaTaskArgs {
            media_id: MediaId::from("nats-test"),
        },
    )
    .unwrap()
}

#[tokio::test]
#[ignore] // Requires NATS server running
async fn test_nats_queue_connection() {
    let queue = NatsTaskQueue::new(&test_config(), Duration::from_secs(60)).await;
    assert!(queue.is_ok());
    assert!(queue.unwrap().is_connected().await);
}

#[tokio::test]
#[ignore] // Requires NATS server running
async fn test_nats_enqueue_registers_task() {
    let queue = NatsTaskQueue::new(&test_config(), Duration::from_secs(60))
        .await
        .unwrap();

    let task = media_task(TaskName::MediaInit);
    let task_id = queue.enqueue(task).await.unwrap();

    let snapshot = queue.inspect().await.unwrap();
    assert!(snapshot.contains_task(&task_id));
    assert_eq!(snapshot.entries[&task_id].state, TaskState::Queued);
}

#[tokio::test]
#[ignore] // Requires NATS server running
async fn test_nats_consume_and_ack() {
    let queue = NatsTaskQueue::new(&test_config(), Duration::from_secs(60))
        .await
        .unwrap();

    let task_id = queue
        .enqueue(media_task(TaskName::CreateHls))
        .await
        .unwrap();

    let mut deliveries = queue.consume(Lane::Long);
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("timed out waiting for delivery")
        .unwrap()
        .unwrap();
    assert_eq!(delivery.task.task_id, task_id);

    delivery.ack().await.unwrap();
    let snapshot = queue.inspect().await.unwrap();
    assert!(!snapshot.contains_task(&task_id));
}

#[tokio::test]
#[ignore] // Requires NATS server running
async fn test_nats_revocation_broadcast() {
    let queue = NatsTaskQueue::new(&test_config(), Duration::from_secs(60))
        .await
        .unwrap();

    let task_id = queue
        .enqueue(media_task(TaskName::EncodeMedia))
        .await
        .unwrap();

    let mut revocations = queue.revocations();
    tokio::time::sleep(Duration::from_millis(200)).await;

    queue
        .revoke(RevokeRequest {
            task_id: task_id.clone(),
            temp_file: None,
        })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), revocations.next())
        .await
        .expect("timed out waiting for revocation")
        .unwrap()
        .unwrap();
    assert_eq!(received.task_id, task_id);
    assert!(!queue.inspect().await.unwrap().contains_task(&task_id));
}

#[tokio::test]
#[ignore] // Requires NATS server running
async fn test_nats_publish_event() {
    let queue = NatsTaskQueue::new(&test_config(), Duration::from_secs(60))
        .await
        .unwrap();

    let event = Event::new(
        EventType::MediaTranscribed,
        "test",
        MediaTranscribedPayload {
            media_id: MediaId::from("nats-test"),
            language_code: "automatic".to_string(),
            subtitle_file: "/tmp/automatic.vtt".into(),
            translate: false,
        },
    )
    .unwrap();

    assert!(queue.publish_event(&event).await.is_ok());
}
