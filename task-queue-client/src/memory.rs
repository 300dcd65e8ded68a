//! In-process task queue used by single-node deployments and tests
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
use chrono::Utc;
use cinecore_types::{Event, Lane, RevokeRequest, TaskEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::error::{QueueError, Result};
use crate::traits::{
    Acknowledger, Delivery, DeliveryStream, QueueSnapshot, RegistryEntry, RevocationStream,
    TaskQueue, TaskState,
};

/// Longest a consumer sleeps before re-checking scheduled tasks
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct MemoryState {
    lanes: HashMap<Lane, Vec<TaskEnvelope>>,
    registry: HashMap<String, RegistryEntry>,
    events: Vec<Event>,
}

impl MemoryState {
    /// Remove and return the next due task of a lane
    fn take_due(&mut self, lane: Lane) -> Option<TaskEnvelope> {
        let now = Utc::now();
        let queue = self.lanes.get_mut(&lane)?;
        let index = queue
            .iter()
            .enumerate()
            .filter(|(_, task)| task.eta.map(|eta| eta <= now).unwrap_or(true))
            .min_by_key(|(_, task)| (task.priority, task.enqueued_at))
            .map(|(index, _)| index)?;
        Some(queue.remove(index))
    }

    /// Time until the earliest scheduled task of a lane is due
    fn next_due_in(&self, lane: Lane) -> Option<Duration> {
        let now = Utc::now();
        self.lanes
            .get(&lane)?
            .iter()
            .filter_map(|task| task.eta)
            .min()
            .map(|eta| (eta - now).to_std().unwrap_or_default())
    }

    fn push(&mut self, task: TaskEnvelope, state: TaskState) {
        self.registry
            .insert(task.task_id.clone(), RegistryEntry::for_task(&task, state));
        self.lanes.entry(task.lane).or_default().push(task);
    }
}

/// In-memory task queue
#[derive(Clone)]
pub struct MemoryTaskQueue {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
    revocations: broadcast::Sender<RevokeRequest>,
    fail_enqueue: Arc<AtomicBool>,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        let (revocations, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify: Arc::new(Notify::new()),
            revocations,
            fail_enqueue: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Registry("memory queue lock poisoned".to_string()))
    }

    /// Reject every enqueue until reset, for exercising rollback paths
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Tasks waiting in a lane, in no particular order
    pub fn queued(&self, lane: Lane) -> Vec<TaskEnvelope> {
        self.lock()
            .map(|state| state.lanes.get(&lane).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Every task waiting in any lane
    pub fn all_queued(&self) -> Vec<TaskEnvelope> {
        self.lock()
            .map(|state| state.lanes.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Events published so far
    pub fn published_events(&self) -> Vec<Event> {
        self.lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    /// Forget a task without going through a worker, as a crashed broker would
    pub fn drop_task(&self, task_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.registry.remove(task_id);
            for queue in state.lanes.values_mut() {
                queue.retain(|task| task.task_id != task_id);
            }
        }
    }

    /// Next due task of a lane without waiting
    pub fn try_next(&self, lane: Lane) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let Some(task) = state.take_due(lane) else {
            return Ok(None);
        };
        if let Some(entry) = state.registry.get_mut(&task.task_id) {
            entry.state = TaskState::Active;
            entry.updated_at = Utc::now();
        }
        let acker = MemoryAcker {
            queue: self.clone(),
            task: task.clone(),
        };
        Ok(Some(Delivery::new(task, Box::new(acker))))
    }
}

struct MemoryAcker {
    queue: MemoryTaskQueue,
    task: TaskEnvelope,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.queue.lock()?;
        if let Some(entry) = state.registry.get(&self.task.task_id) {
            // A retry re-enqueued under the same id is live again
            if entry.state == TaskState::Active {
                state.registry.remove(&self.task.task_id);
            }
        }
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        let mut task = self.task.clone();
        let state_kind = match delay {
            Some(delay) if !delay.is_zero() => {
                task.eta = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
                TaskState::Scheduled
            }
            _ => {
                task.eta = None;
                TaskState::Queued
            }
        };
        self.queue.lock()?.push(task, state_kind);
        self.queue.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: TaskEnvelope) -> Result<String> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Publish("memory queue rejected task".to_string()));
        }
        let task_id = task.task_id.clone();
        debug!(
            task_id = %task_id,
            task = %task.name,
            lane = %task.lane,
            priority = task.priority,
            "Task enqueued"
        );
        let initial = RegistryEntry::initial_state(&task);
        self.lock()?.push(task, initial);
        self.notify.notify_waiters();
        Ok(task_id)
    }

    fn consume(&self, lane: Lane) -> DeliveryStream<'_> {
        info!(lane = %lane, "Consuming lane");
        Box::pin(futures::stream::unfold(self.clone(), move |queue| async move {
            loop {
                let notify = queue.notify.clone();
                let notified = notify.notified();
                match queue.try_next(lane) {
                    Ok(Some(delivery)) => return Some((Ok(delivery), queue)),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), queue)),
                }
                let wait = queue
                    .lock()
                    .ok()
                    .and_then(|state| state.next_due_in(lane))
                    .map(|d| d.min(IDLE_POLL))
                    .unwrap_or(IDLE_POLL);
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }))
    }

    async fn inspect(&self) -> Result<QueueSnapshot> {
        let state = self.lock()?;
        Ok(QueueSnapshot::from_entries(state.registry.values().cloned()))
    }

    async fn revoke(&self, request: RevokeRequest) -> Result<()> {
        self.drop_task(&request.task_id);
        info!(task_id = %request.task_id, "Task revoked");
        // No receivers is fine: nothing is running
        let _ = self.revocations.send(request);
        Ok(())
    }

    fn revocations(&self) -> RevocationStream<'_> {
        let rx = self.revocations.subscribe();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(request) => return Some((Ok(request), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    async fn publish_event(&self, event: &Event) -> Result<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn client_type(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinecore_types::{MediaId, MediaTaskArgs, TaskName, PRIORITY_HIGH};
    use futures::StreamExt;

    fn task(name: TaskName) -> TaskEnvelope {
        TaskEnvelope::new(
            name,
            MediaTaskArgs {
                media_id: MediaId::from("m1"),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_priority_order_within_lane() {
        let queue = MemoryTaskQueue::new();
        let normal = task(TaskName::EncodeMedia);
        let high = task(TaskName::EncodeMedia).with_priority(PRIORITY_HIGH);
        queue.enqueue(normal.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();

        let first = queue.try_next(Lane::Long).unwrap().unwrap();
        assert_eq!(first.task.task_id, high.task_id);
        let second = queue.try_next(Lane::Long).unwrap().unwrap();
        assert_eq!(second.task.task_id, normal.task_id);
        assert!(queue.try_next(Lane::Short).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registry_tracks_lifecycle() {
        let queue = MemoryTaskQueue::new();
        let t = task(TaskName::MediaInit);
        queue.enqueue(t.clone()).await.unwrap();
        assert_eq!(queue.inspect().await.unwrap().count(TaskState::Queued), 1);

        let delivery = queue.try_next(Lane::Short).unwrap().unwrap();
        assert_eq!(queue.inspect().await.unwrap().count(TaskState::Active), 1);

        delivery.ack().await.unwrap();
        assert!(queue.inspect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_countdown_holds_task_back() {
        let queue = MemoryTaskQueue::new();
        queue
            .enqueue(task(TaskName::EncodeMedia).with_countdown(60))
            .await
            .unwrap();

        assert!(queue.try_next(Lane::Long).unwrap().is_none());
        let snapshot = queue.inspect().await.unwrap();
        assert_eq!(snapshot.count(TaskState::Scheduled), 1);
    }

    #[tokio::test]
    async fn test_nak_requeues() {
        let queue = MemoryTaskQueue::new();
        let t = task(TaskName::CreateHls);
        queue.enqueue(t.clone()).await.unwrap();

        let delivery = queue.try_next(Lane::Long).unwrap().unwrap();
        delivery.nak(None).await.unwrap();

        let again = queue.try_next(Lane::Long).unwrap().unwrap();
        assert_eq!(again.task.task_id, t.task_id);
    }

    #[tokio::test]
    async fn test_consume_stream_yields_enqueued_task() {
        let queue = MemoryTaskQueue::new();
        let mut stream = queue.consume(Lane::Short);

        let producer = queue.clone();
        let t = task(TaskName::ChunkizeMedia);
        let expected = t.task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(t).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.task.task_id, expected);
    }

    #[tokio::test]
    async fn test_revoke_broadcasts_and_drops() {
        let queue = MemoryTaskQueue::new();
        let t = task(TaskName::EncodeMedia);
        queue.enqueue(t.clone()).await.unwrap();
        let mut revocations = queue.revocations();

        queue
            .revoke(RevokeRequest {
                task_id: t.task_id.clone(),
                temp_file: None,
            })
            .await
            .unwrap();

        let received = revocations.next().await.unwrap().unwrap();
        assert_eq!(received.task_id, t.task_id);
        assert!(!queue.inspect().await.unwrap().contains_task(&t.task_id));
        assert!(queue.queued(Lane::Long).is_empty());
    }

    #[tokio::test]
    async fn test_fail_enqueue() {
        let queue = MemoryTaskQueue::new();
        queue.set_fail_enqueue(true);
        assert!(queue.enqueue(task(TaskName::MediaInit)).await.is_err());
        assert!(queue.inspect().await.unwrap().is_empty());
    }
}
