//! Periodic task scheduler
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


use cinecore_types::{TaskEnvelope, TaskName};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::traits::TaskQueue;

/// One recurring task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub name: TaskName,
    pub interval: Duration,
}

/// Enqueues argument-less tasks on fixed intervals
#[derive(Debug, Clone, Default)]
pub struct PeriodicScheduler {
    entries: Vec<ScheduleEntry>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; a zero interval leaves it disabled
    pub fn every(mut self, name: TaskName, interval: Duration) -> Self {
        if interval.is_zero() {
            info!(task = %name, "Periodic task disabled");
        } else {
            self.entries.push(ScheduleEntry { name, interval });
        }
        self
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Spawn one ticker per entry. The first run happens one interval
    /// after start.
    pub fn spawn(
        self,
        queue: Arc<dyn TaskQueue>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|entry| {
                let queue = Arc::clone(&queue);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(entry.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker.tick().await;

                    info!(
                        task = %entry.name,
                        interval_secs = entry.interval.as_secs(),
                        "Periodic task scheduled"
                    );

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                enqueue_tick(queue.as_ref(), entry.name).await;
                            }
                        }
                    }
                    debug!(task = %entry.name, "Periodic task stopped");
                })
            })
            .collect()
    }
}

async fn enqueue_tick(queue: &dyn TaskQueue, name: TaskName) {
    let task = match TaskEnvelope::new(name, serde_json::json!({})) {
        Ok(task) => task,
        Err(e) => {
            error!(task = %name, error = %e, "Failed to build periodic task");
            return;
        }
    };
    match queue.enqueue(task).await {
        Ok(task_id) => debug!(task = %name, task_id = %task_id, "Periodic task enqueued"),
        Err(e) => error!(task = %name, error = %e, "Failed to enqueue periodic task"),
    }
}
