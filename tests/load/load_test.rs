//! Load Tests for the task queue
//!
//! Enqueues many encode tasks concurrently and drains them with a
//! handful of consumers.
//!
//! Run with: cargo test --test load_test --release -- --ignored

use cinecore_config::MessageBusConfig;
use cinecore_types::{Lane, MediaId, MediaTaskArgs, TaskEnvelope, TaskName};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task_queue_client::{NatsTaskQueue, TaskQueue};
use uuid::Uuid;

#[tokio::test]
#[ignore] // Requires NATS server and should be run manually
async fn test_concurrent_enqueue_and_drain() {
    let tag = Uuid::new_v4().simple().to_string();
    let config = MessageBusConfig {
        stream_name: format!("LOAD_{}", tag.to_uppercase()),
        subject_prefix: format!("load-{}", &tag[..8]),
        registry_bucket: format!("load-registry-{}", &tag[..8]),
        ..MessageBusConfig::default()
    };
    let queue = Arc::new(
        NatsTaskQueue::new(&config, Duration::from_secs(30))
            .await
            .expect("Failed to connect to NATS"),
    );

    let num_tasks = 500;
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..num_tasks {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            let task = TaskEnvelope::new(
                TaskName::EncodeMedia,
                MediaTaskArgs {
                    media_id: MediaId::new(format!("load-{}", i)),
                },
            )
            .expect("Failed to build task");
            queue.enqueue(task).await
        }));
    }
    let mut expected = HashSet::new();
    for handle in handles {
        let task_id = handle.await.expect("Task panicked").expect("Failed to enqueue");
        expected.insert(task_id);
    }
    let enqueue_elapsed = start.elapsed();
    println!(
        "Enqueued {} tasks in {:?} ({:.0}/s)",
        num_tasks,
        enqueue_elapsed,
        num_tasks as f64 / enqueue_elapsed.as_secs_f64()
    );

    let start = Instant::now();
    let mut seen = HashSet::new();
    let mut deliveries = queue.consume(Lane::Long);
    while seen.len() < num_tasks {
        let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.next())
            .await
            .expect("Timeout draining the queue")
            .expect("Stream ended")
            .expect("Delivery failed");
        seen.insert(delivery.task.task_id.clone());
        delivery.ack().await.expect("Failed to ack");
    }
    println!("Drained {} tasks in {:?}", num_tasks, start.elapsed());

    assert_eq!(seen, expected);
    let snapshot = queue.inspect().await.expect("Failed to inspect");
    assert!(snapshot.is_empty());
}
