//! NATS JetStream implementation of the task queue
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


use async_nats::jetstream::{self, consumer::pull, kv, AckKind, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use cinecore_config::MessageBusConfig;
use cinecore_types::{Event, Lane, RevokeRequest, TaskEnvelope, PRIORITY_HIGH};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::traits::{
    Acknowledger, Delivery, DeliveryStream, QueueSnapshot, RegistryEntry, RevocationStream,
    TaskQueue, TaskState,
};

/// How long a normal-priority fetch waits before polling high priority again
const FETCH_EXPIRES: Duration = Duration::from_secs(1);

/// NATS JetStream task queue.
///
/// Tasks live in a work-queue stream on `<prefix>.tasks.<lane>.<p0|p9>`,
/// the live task registry in a key/value bucket. Revocations and events
/// travel over core NATS subjects.
pub struct NatsTaskQueue {
    client: Arc<async_nats::Client>,
    jetstream: Arc<Context>,
    registry: kv::Store,
    stream_name: String,
    subject_prefix: String,
    ack_wait: Duration,
}

impl NatsTaskQueue {
    /// Connect and ensure the task stream and registry bucket exist
    pub async fn new(config: &MessageBusConfig, ack_wait: Duration) -> Result<Self> {
        info!(url = %config.url, "Connecting to NATS server");

        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let client_arc = Arc::new(client.clone());
        let jetstream = jetstream::new(client);

        Self::ensure_stream(&jetstream, &config.stream_name, &config.subject_prefix).await?;
        let registry = Self::ensure_registry(&jetstream, &config.registry_bucket).await?;

        info!(
            stream = %config.stream_name,
            registry = %config.registry_bucket,
            "NATS task queue initialized"
        );

        Ok(Self {
            client: client_arc,
            jetstream: Arc::new(jetstream),
            registry,
            stream_name: config.stream_name.clone(),
            subject_prefix: config.subject_prefix.clone(),
            ack_wait,
        })
    }

    /// Ensure the JetStream work-queue stream exists
    async fn ensure_stream(jetstream: &Context, stream_name: &str, subject_prefix: &str) -> Result<()> {
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![format!("{}.tasks.>", subject_prefix)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                max_age: Duration::from_secs(86400 * 7), // 7 days retention
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create stream: {}", e)))?;

        info!(stream = stream_name, "Stream ensured");
        Ok(())
    }

    async fn ensure_registry(jetstream: &Context, bucket: &str) -> Result<kv::Store> {
        if let Ok(store) = jetstream.get_key_value(bucket).await {
            return Ok(store);
        }
        jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Registry(format!("Failed to create bucket: {}", e)))
    }

    /// Subject a task is published on
    pub fn subject_for(prefix: &str, lane: Lane, priority: u8) -> String {
        format!("{}.tasks.{}.{}", prefix, lane.as_str(), priority_class(priority))
    }

    fn revoke_subject(&self) -> String {
        format!("{}.control.revoke", self.subject_prefix)
    }

    fn event_subject(&self, event: &Event) -> String {
        format!("{}.events.{}", self.subject_prefix, event.event_type.subject())
    }

    async fn put_entry(registry: &kv::Store, entry: &RegistryEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        registry
            .put(entry.task_id.as_str(), Bytes::from(value))
            .await
            .map_err(|e| QueueError::Registry(e.to_string()))?;
        Ok(())
    }

    async fn get_entry(registry: &kv::Store, task_id: &str) -> Result<Option<RegistryEntry>> {
        let value = registry
            .get(task_id)
            .await
            .map_err(|e| QueueError::Registry(e.to_string()))?;
        match value {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    async fn lane_consumer(
        stream: &jetstream::stream::Stream,
        subject_prefix: &str,
        lane: Lane,
        priority: u8,
        ack_wait: Duration,
    ) -> Result<jetstream::consumer::Consumer<pull::Config>> {
        let name = format!("{}-{}", lane.as_str(), priority_class(priority));
        stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: Self::subject_for(subject_prefix, lane, priority),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Consume(format!("Failed to create consumer {}: {}", name, e)))
    }

    /// High priority first without waiting, then a short wait on normal priority
    async fn next_message(
        high: &jetstream::consumer::Consumer<pull::Config>,
        normal: &jetstream::consumer::Consumer<pull::Config>,
    ) -> Result<Option<jetstream::Message>> {
        let mut batch = high
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        if let Some(message) = batch.next().await {
            return message.map(Some).map_err(|e| QueueError::Consume(e.to_string()));
        }

        let mut batch = normal
            .batch()
            .max_messages(1)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        match batch.next().await {
            Some(message) => message.map(Some).map_err(|e| QueueError::Consume(e.to_string())),
            None => Ok(None),
        }
    }
}

fn priority_class(priority: u8) -> &'static str {
    if priority <= PRIORITY_HIGH {
        "p0"
    } else {
        "p9"
    }
}

struct NatsAcker {
    message: jetstream::Message,
    registry: kv::Store,
    task_id: String,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(QueueError::Nats)?;
        // A retry re-enqueued under the same id is live again
        if let Some(entry) = NatsTaskQueue::get_entry(&self.registry, &self.task_id).await? {
            if entry.state == TaskState::Active {
                self.registry
                    .delete(self.task_id.as_str())
                    .await
                    .map_err(|e| QueueError::Registry(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        if let Some(mut entry) = NatsTaskQueue::get_entry(&self.registry, &self.task_id).await? {
            entry.state = match delay {
                Some(d) if !d.is_zero() => TaskState::Scheduled,
                _ => TaskState::Queued,
            };
            entry.updated_at = Utc::now();
            NatsTaskQueue::put_entry(&self.registry, &entry).await?;
        }
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(QueueError::Nats)
    }
}

#[async_trait]
impl TaskQueue for NatsTaskQueue {
    async fn enqueue(&self, task: TaskEnvelope) -> Result<String> {
        let subject = Self::subject_for(&self.subject_prefix, task.lane, task.priority);
        let entry = RegistryEntry::for_task(&task, RegistryEntry::initial_state(&task));
        Self::put_entry(&self.registry, &entry).await?;

        let payload = serde_json::to_vec(&task)?;
        let published = async {
            self.jetstream
                .publish(subject.clone(), Bytes::from(payload))
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))
        }
        .await;

        if let Err(e) = published {
            let _ = self.registry.delete(task.task_id.as_str()).await;
            return Err(e);
        }

        debug!(
            task_id = %task.task_id,
            task = %task.name,
            subject = %subject,
            "Task enqueued"
        );
        Ok(task.task_id)
    }

    fn consume(&self, lane: Lane) -> DeliveryStream<'_> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Delivery>>(1);
        let jetstream = Arc::clone(&self.jetstream);
        let registry = self.registry.clone();
        let stream_name = self.stream_name.clone();
        let prefix = self.subject_prefix.clone();
        let ack_wait = self.ack_wait;

        info!(lane = %lane, stream = %stream_name, "Consuming lane");

        tokio::spawn(async move {
            let consumers = async {
                let stream = jetstream
                    .get_stream(&stream_name)
                    .await
                    .map_err(|e| QueueError::Consume(e.to_string()))?;
                let high = Self::lane_consumer(&stream, &prefix, lane, PRIORITY_HIGH, ack_wait).await?;
                let normal = Self::lane_consumer(&stream, &prefix, lane, u8::MAX, ack_wait).await?;
                Ok::<_, QueueError>((high, normal))
            }
            .await;

            let (high, normal) = match consumers {
                Ok(consumers) => consumers,
                Err(e) => {
                    error!(lane = %lane, error = %e, "Failed to create lane consumers");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            while !tx.is_closed() {
                let message = match Self::next_message(&high, &normal).await {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(lane = %lane, error = %e, "Failed to fetch task");
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(FETCH_EXPIRES).await;
                        continue;
                    }
                };

                let task: TaskEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(task) => task,
                    Err(e) => {
                        error!(lane = %lane, error = %e, "Dropping undecodable task");
                        let _ = message.ack().await;
                        continue;
                    }
                };

                let delay = task.delay_remaining(Utc::now());
                if !delay.is_zero() {
                    let _ = message.ack_with(AckKind::Nak(Some(delay))).await;
                    continue;
                }

                // Tasks missing from the registry were revoked while queued
                let mut entry = match Self::get_entry(&registry, &task.task_id).await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        debug!(task_id = %task.task_id, "Skipping revoked task");
                        let _ = message.ack().await;
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = %task.task_id, error = %e, "Registry lookup failed");
                        RegistryEntry::for_task(&task, TaskState::Active)
                    }
                };
                entry.state = TaskState::Active;
                entry.updated_at = Utc::now();
                if let Err(e) = Self::put_entry(&registry, &entry).await {
                    warn!(task_id = %task.task_id, error = %e, "Failed to mark task active");
                }

                let acker = NatsAcker {
                    message,
                    registry: registry.clone(),
                    task_id: task.task_id.clone(),
                };
                if tx.send(Ok(Delivery::new(task, Box::new(acker)))).await.is_err() {
                    break;
                }
            }
            info!(lane = %lane, "Lane consumer stopped");
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn inspect(&self) -> Result<QueueSnapshot> {
        let mut keys = self
            .registry
            .keys()
            .await
            .map_err(|e| QueueError::Registry(e.to_string()))?;

        let mut entries = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| QueueError::Registry(e.to_string()))?;
            if let Some(entry) = Self::get_entry(&self.registry, &key).await? {
                entries.push(entry);
            }
        }
        Ok(QueueSnapshot::from_entries(entries))
    }

    async fn revoke(&self, request: RevokeRequest) -> Result<()> {
        self.registry
            .delete(request.task_id.as_str())
            .await
            .map_err(|e| QueueError::Registry(e.to_string()))?;

        let payload = serde_json::to_vec(&request)?;
        self.client
            .publish(self.revoke_subject(), Bytes::from(payload))
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        info!(task_id = %request.task_id, "Task revoked");
        Ok(())
    }

    fn revocations(&self) -> RevocationStream<'_> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<RevokeRequest>>(16);
        let client = Arc::clone(&self.client);
        let subject = self.revoke_subject();

        tokio::spawn(async move {
            match client.subscribe(subject.clone()).await {
                Ok(mut subscriber) => {
                    info!(subject = %subject, "Listening for revocations");
                    while let Some(message) = subscriber.next().await {
                        let request = serde_json::from_slice::<RevokeRequest>(&message.payload)
                            .map_err(QueueError::Serialization);
                        if tx.send(request).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to revocations");
                    let _ = tx.send(Err(QueueError::Consume(e.to_string()))).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn publish_event(&self, event: &Event) -> Result<()> {
        let subject = self.event_subject(event);
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        info!(
            event_type = ?event.event_type,
            event_id = %event.event_id,
            subject = %subject,
            "Event published"
        );
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    fn client_type(&self) -> &str {
        "nats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_split_priority() {
        assert_eq!(
            NatsTaskQueue::subject_for("cinecore", Lane::Long, 0),
            "cinecore.tasks.long.p0"
        );
        assert_eq!(
            NatsTaskQueue::subject_for("cinecore", Lane::Long, 9),
            "cinecore.tasks.long.p9"
        );
        assert_eq!(
            NatsTaskQueue::subject_for("cinecore", Lane::Transcription, 5),
            "cinecore.tasks.transcription.p9"
        );
    }
}
