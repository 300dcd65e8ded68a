//! Task dispatcher
//!
//! One consumer per configured lane, each bounded by the lane concurrency,
//! plus a listener that stops revoked processes on this node.
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


use crate::artifacts;
use crate::encoder::{encode_media, EncodeOutcome};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::reconcile;
use crate::runner::kill_by_pattern;
use cinecore_config::WorkerConfig;
use cinecore_types::{
    ChunkizeMediaArgs, EncodeMediaArgs, Lane, MediaTaskArgs, RevokeRequest, TaskEnvelope,
    TaskName, TranscribeArgs,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lanes this worker consumes with their concurrency
pub fn lane_plan(config: &WorkerConfig) -> Vec<(Lane, usize)> {
    let mut plan = Vec::new();
    for name in &config.lanes {
        let lane = match Lane::parse(name) {
            Some(lane) => lane,
            None => {
                warn!(lane = %name, "Unknown lane in configuration, ignoring");
                continue;
            }
        };
        if plan.iter().any(|(l, _)| *l == lane) {
            continue;
        }
        let concurrency = match lane {
            Lane::Short => config.short_concurrency,
            Lane::Long => config.long_concurrency,
            Lane::Transcription => config.transcription_concurrency,
        };
        if concurrency > 0 {
            plan.push((lane, concurrency));
        }
    }
    plan
}

/// Worker that consumes the task lanes
pub struct TaskWorker {
    pipeline: Pipeline,
    shutdown: CancellationToken,
}

impl TaskWorker {
    pub fn new(pipeline: Pipeline, shutdown: CancellationToken) -> Self {
        Self { pipeline, shutdown }
    }

    /// Consume until shutdown, then wait for in-flight tasks
    pub async fn run(&self) -> anyhow::Result<()> {
        let plan = lane_plan(&self.pipeline.config().worker);
        if plan.is_empty() {
            return Err(anyhow::anyhow!("No lanes to consume"));
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(tokio::spawn(listen_revocations(
            self.pipeline.clone(),
            self.shutdown.clone(),
        )));
        for (lane, concurrency) in plan {
            info!(lane = %lane, concurrency, "Consuming lane");
            handles.push(tokio::spawn(consume_lane(
                self.pipeline.clone(),
                lane,
                concurrency,
                self.shutdown.clone(),
            )));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Task worker stopped");
        Ok(())
    }
}

async fn consume_lane(p: Pipeline, lane: Lane, concurrency: usize, shutdown: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let queue = p.queue().clone();
    let mut deliveries = queue.consume(lane);

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(lane = %lane, error = %e, "Error receiving task");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            None => {
                warn!(lane = %lane, "Task stream ended");
                break;
            }
        };

        let pipeline = p.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let task = delivery.task.clone();
            debug!(task = %task.name, task_id = %task.task_id, retries = task.retries, "Task received");

            if let Err(e) = handle_task(&pipeline, &task).await {
                error!(task = %task.name, task_id = %task.task_id, error = %e, "Task failed");
            }
            if let Err(e) = delivery.ack().await {
                warn!(task_id = %task.task_id, error = %e, "Failed to ack task");
            }
        });
    }

    // drain: every permit back means nothing is in flight
    let _ = semaphore.acquire_many(concurrency as u32).await;
    debug!(lane = %lane, "Lane consumer stopped");
}

/// Run one task to completion
pub async fn handle_task(p: &Pipeline, task: &TaskEnvelope) -> Result<()> {
    match task.name {
        TaskName::MediaInit => {
            let args: MediaTaskArgs = task.args_as()?;
            let status = p.media_init(&args.media_id).await?;
            info!(media_id = %args.media_id, status = %status, "Media initialized");
        }
        TaskName::ChunkizeMedia => {
            let args: ChunkizeMediaArgs = task.args_as()?;
            p.chunkize(&args).await?;
        }
        TaskName::EncodeMedia => {
            let args: EncodeMediaArgs = task.args_as()?;
            match encode_media(p, task, &args).await? {
                EncodeOutcome::Failed { permanent: true, .. } => {
                    debug!(encoding_id = %args.encoding_id, "Permanent failure recorded")
                }
                outcome => debug!(encoding_id = %args.encoding_id, outcome = ?outcome, "Encode task done"),
            }
        }
        TaskName::ProduceSprite => {
            let args: MediaTaskArgs = task.args_as()?;
            let cancel = p.processes.register(&task.task_id);
            let result = artifacts::produce_sprite(p, &args.media_id, &cancel).await;
            p.processes.remove(&task.task_id);
            result?;
        }
        TaskName::CreateHls => {
            let args: MediaTaskArgs = task.args_as()?;
            let cancel = p.processes.register(&task.task_id);
            let result = artifacts::create_hls(p, &args.media_id, &cancel).await;
            p.processes.remove(&task.task_id);
            result?;
        }
        TaskName::WhisperTranscribe => {
            let args: TranscribeArgs = task.args_as()?;
            let cancel = p.processes.register(&task.task_id);
            let result = artifacts::whisper_transcribe(p, &args, &cancel).await;
            p.processes.remove(&task.task_id);
            result?;
        }
        TaskName::CheckRunningStates
        | TaskName::CheckPendingStates
        | TaskName::CheckMissingProfiles
        | TaskName::CheckMediaStates => {
            if let Some(result) = reconcile::run_sweep(p, task.name).await {
                result?;
            }
        }
    }
    Ok(())
}

async fn listen_revocations(p: Pipeline, shutdown: CancellationToken) {
    let queue = p.queue().clone();
    let mut revocations = queue.revocations();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = revocations.next() => next,
        };
        match next {
            Some(Ok(request)) => stop_revoked(&p, request).await,
            Some(Err(e)) => {
                warn!(error = %e, "Error receiving revocation");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            None => break,
        }
    }
}

/// Cancel a revoked task running here. Processes this node does not track
/// are looked up by their working file.
pub async fn stop_revoked(p: &Pipeline, request: RevokeRequest) {
    p.processes().mark_revoked(&request.task_id);
    if p.processes().cancel(&request.task_id) {
        info!(task_id = %request.task_id, "Revoked running task");
        return;
    }
    let Some(temp_file) = request.temp_file else {
        return;
    };
    match tokio::task::spawn_blocking(move || kill_by_pattern(&temp_file)).await {
        Ok(Ok(0)) => {}
        Ok(Ok(killed)) => info!(task_id = %request.task_id, killed, "Killed processes of revoked task"),
        Ok(Err(e)) => warn!(task_id = %request.task_id, error = %e, "Pattern kill failed"),
        Err(e) => warn!(error = %e, "Pattern kill task failed"),
    }
}
