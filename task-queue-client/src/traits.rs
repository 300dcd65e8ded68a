//! Traits for task queue operations
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


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinecore_types::{Event, Lane, MediaProfilePair, RevokeRequest, TaskEnvelope, TaskName};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;

/// Where a registered task currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be picked up
    Queued,
    /// Held back until its eta
    Scheduled,
    /// Delivered to a worker
    Active,
}

/// Registry entry for one live task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub task_id: String,
    pub name: TaskName,
    pub lane: Lane,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<MediaProfilePair>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn for_task(task: &TaskEnvelope, state: TaskState) -> Self {
        Self {
            task_id: task.task_id.clone(),
            name: task.name,
            lane: task.lane,
            state,
            correlation: task.correlation.clone(),
            updated_at: Utc::now(),
        }
    }

    /// State a task enters when enqueued
    pub fn initial_state(task: &TaskEnvelope) -> TaskState {
        match task.eta {
            Some(eta) if eta > Utc::now() => TaskState::Scheduled,
            _ => TaskState::Queued,
        }
    }
}

/// Point-in-time view of every live task
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub entries: HashMap<String, RegistryEntry>,
}

impl QueueSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.task_id.clone(), entry))
                .collect(),
        }
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    /// True if any live task is correlated with this (media, profile)
    pub fn contains_pair(&self, pair: &MediaProfilePair) -> bool {
        self.entries
            .values()
            .any(|entry| entry.correlation.as_ref() == Some(pair))
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settles a delivered task with the queue
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Task finished, remove it for good
    async fn ack(&self) -> Result<()>;

    /// Hand the task back, optionally delayed
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;
}

/// A task handed to a worker
pub struct Delivery {
    pub task: TaskEnvelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(task: TaskEnvelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { task, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("task", &self.task).finish()
    }
}

pub type DeliveryStream<'a> = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send + 'a>>;
pub type RevocationStream<'a> = Pin<Box<dyn Stream<Item = Result<RevokeRequest>> + Send + 'a>>;

/// Trait for task queue clients
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task, returning its task id once the queue accepted it
    async fn enqueue(&self, task: TaskEnvelope) -> Result<String>;

    /// Consume due tasks of a lane, lowest priority value first.
    /// Delivery is at-least-once; every delivery must be acked or nacked.
    fn consume(&self, lane: Lane) -> DeliveryStream<'_>;

    /// Snapshot of queued, scheduled and active tasks
    async fn inspect(&self) -> Result<QueueSnapshot>;

    /// Broadcast a revocation to every worker and drop the task from the registry
    async fn revoke(&self, request: RevokeRequest) -> Result<()>;

    /// Revocations broadcast by any node
    fn revocations(&self) -> RevocationStream<'_>;

    /// Publish an event for downstream collaborators
    async fn publish_event(&self, event: &Event) -> Result<()>;

    /// Check if the client is connected
    async fn is_connected(&self) -> bool;

    /// Get the client type name
    fn client_type(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinecore_types::{MediaId, MediaTaskArgs};

    #[test]
    fn test_snapshot_lookups() {
        let task = TaskEnvelope::new(
            TaskName::EncodeMedia,
            MediaTaskArgs {
                media_id: MediaId::from("m1"),
            },
        )
        .unwrap()
        .with_correlation(MediaId::from("m1"), 2);

        let snapshot =
            QueueSnapshot::from_entries(vec![RegistryEntry::for_task(&task, TaskState::Active)]);

        assert!(snapshot.contains_task(&task.task_id));
        assert!(snapshot.contains_pair(&MediaProfilePair::new(MediaId::from("m1"), 2)));
        assert!(!snapshot.contains_pair(&MediaProfilePair::new(MediaId::from("m1"), 3)));
        assert_eq!(snapshot.count(TaskState::Active), 1);
        assert_eq!(snapshot.count(TaskState::Queued), 0);
    }

    #[test]
    fn test_initial_state_follows_eta() {
        let task = TaskEnvelope::new(TaskName::CheckMediaStates, serde_json::json!({})).unwrap();
        assert_eq!(RegistryEntry::initial_state(&task), TaskState::Queued);
        let delayed = task.with_countdown(30);
        assert_eq!(RegistryEntry::initial_state(&delayed), TaskState::Scheduled);
    }
}
