//! Pipeline facade
//!
//! Owns the shared collaborators and implements media initialization, encode
//! submission, chunking, revocation and the aggregate status API.
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
use crate::assembler;
use crate::chunker::{chunk_priority, ChunkPlanner};
use crate::command::CommandBuilder;
use crate::error::{PipelineError, Result};
use crate::jobs::{aggregate_status, required_profiles};
use crate::parser::{FfmpegSegmentParser, FfmpegTimecodeParser};
use crate::probe::Prober;
use crate::retry::{
    is_retryable_transport_error, retry_with_backoff, FailureClassifier, RetryConfig, RetryPolicy,
};
use crate::runner::{ProcessRegistry, ProcessRunner, RunLimits};
use crate::store::JobStore;
use chrono::Utc;
use cinecore_config::PipelineConfig;
use cinecore_types::{
    ChunkDescriptor, ChunkizeMediaArgs, Codec, Container, EncodeMediaArgs, EncodeProfile,
    EncodingJob, EncodingStatus, Event, EventType, MediaEncodedPayload, MediaId, MediaTaskArgs,
    MediaType, ProfileId, RevokeRequest, SourceMedia, TaskEnvelope, TaskName, TranscribeArgs,
    PRIORITY_HIGH,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::{QueueError, TaskQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name events are published under
pub const EVENT_SOURCE: &str = "media-processor";

/// Result of an encode request
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncodeSubmission {
    pub media_id: Option<MediaId>,
    /// Task id of the chunking task, when the media is segmented first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_task: Option<String>,
    pub queued: Vec<QueuedEncode>,
    /// Profiles not applicable to this media
    pub skipped: Vec<ProfileId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEncode {
    pub profile_id: ProfileId,
    pub encoding_id: Uuid,
    pub task_id: String,
}

/// Per-profile view served by the status API
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub profile_id: ProfileId,
    pub profile_name: String,
    pub status: Option<EncodingStatus>,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_file: Option<PathBuf>,
    pub chunks: usize,
    pub chunks_done: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaStatus {
    pub media_id: MediaId,
    pub media_type: MediaType,
    pub encoding_status: EncodingStatus,
    pub profiles: Vec<ProfileStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprites: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster: Option<PathBuf>,
}

/// Shared pipeline state handed to every task handler
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) processes: ProcessRegistry,
    pub(crate) builder: CommandBuilder,
    pub(crate) planner: ChunkPlanner,
    pub(crate) prober: Prober,
    pub(crate) runner: ProcessRunner,
    pub(crate) classifier: FailureClassifier,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) queue_retry: RetryConfig,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let limits = RunLimits {
            soft_limit: Duration::from_secs(config.encoding.soft_time_limit_secs),
            grace: Duration::from_secs(config.encoding.termination_grace_secs),
        };
        Self {
            builder: CommandBuilder::from_config(&config),
            planner: ChunkPlanner::from_config(&config, Arc::new(FfmpegSegmentParser)),
            prober: Prober::new(config.tools.ffprobe.clone()),
            runner: ProcessRunner::new(Arc::new(FfmpegTimecodeParser), limits),
            classifier: FailureClassifier::from_config(&config.encoding),
            retry_policy: RetryPolicy::from_config(&config.encoding),
            queue_retry: RetryConfig::default(),
            processes: ProcessRegistry::new(),
            config: Arc::new(config),
            store,
            queue,
        }
    }

    /// Backoff used for queue and event bus calls
    pub fn with_queue_retry(mut self, retry: RetryConfig) -> Self {
        self.queue_retry = retry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker.name
    }

    /// Enqueue with backoff on transport errors
    pub async fn enqueue(&self, task: TaskEnvelope) -> Result<String> {
        let queue = self.queue.clone();
        let task_id = retry_with_backoff(
            &self.queue_retry,
            "enqueue",
            |e: &QueueError| is_retryable_transport_error(&e.to_string()),
            || {
                let queue = queue.clone();
                let task = task.clone();
                async move { queue.enqueue(task).await }
            },
        )
        .await?;
        Ok(task_id)
    }

    /// Publish an event. Failures are logged, never returned.
    pub async fn publish(&self, event: Event) {
        let queue = self.queue.clone();
        let result = retry_with_backoff(
            &self.queue_retry,
            "publish_event",
            |e: &QueueError| is_retryable_transport_error(&e.to_string()),
            || {
                let queue = queue.clone();
                let event = event.clone();
                async move { queue.publish_event(&event).await }
            },
        )
        .await;
        if let Err(e) = result {
            warn!(event_type = ?event.event_type, error = %e, "Failed to publish event");
        }
    }

    pub(crate) async fn require_media(&self, media_id: &MediaId) -> Result<SourceMedia> {
        self.store
            .get_media(media_id)
            .await?
            .ok_or_else(|| PipelineError::MediaNotFound(media_id.clone()))
    }

    /// Probe a freshly uploaded media file, record what was found and
    /// kick off encoding and derived artifacts for videos.
    pub async fn media_init(&self, media_id: &MediaId) -> Result<EncodingStatus> {
        let mut media = self.require_media(media_id).await?;
        info!(media_id = %media_id, path = %media.file_path.display(), "Initializing media");

        match self.prober.probe(&media.file_path).await {
            Ok(outcome) => media.apply_probe(outcome.media_type, outcome.info),
            Err(e) => {
                warn!(media_id = %media_id, error = %e, "Probe failed, media will not be encoded");
                media.media_type = MediaType::Other;
                media.updated_at = Utc::now();
            }
        }
        self.store.save_media(&media).await?;

        if media.is_video() {
            if self.config.artifacts.produce_poster {
                artifacts::produce_poster(self, &media).await;
            }

            if let Err(e) = self.encode(media_id, &[], true).await {
                error!(media_id = %media_id, error = %e, "Failed to submit encodes");
            }

            if self.config.artifacts.produce_sprites {
                let task = TaskEnvelope::new(
                    TaskName::ProduceSprite,
                    MediaTaskArgs {
                        media_id: media_id.clone(),
                    },
                )?;
                if let Err(e) = self.enqueue(task).await {
                    warn!(media_id = %media_id, error = %e, "Failed to queue sprite task");
                }
            }
        }

        self.refresh_status(media_id).await
    }

    async fn resolve_profiles(&self, ids: &[ProfileId]) -> Result<Vec<EncodeProfile>> {
        if ids.is_empty() {
            return Ok(self.store.list_profiles(true).await?);
        }
        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            let profile = self
                .store
                .get_profile(*id)
                .await?
                .ok_or(PipelineError::ProfileNotFound(*id))?;
            profiles.push(profile);
        }
        Ok(profiles)
    }

    /// Encode request: queue the given profiles (all active ones when
    /// empty). Long sources are handed to the chunk planner first.
    pub async fn encode(
        &self,
        media_id: &MediaId,
        profile_ids: &[ProfileId],
        force: bool,
    ) -> Result<EncodeSubmission> {
        let media = self.require_media(media_id).await?;
        let mut submission = EncodeSubmission {
            media_id: Some(media_id.clone()),
            ..EncodeSubmission::default()
        };

        if !media.is_video() {
            info!(media_id = %media_id, media_type = media.media_type.as_str(), "Not a video, nothing to encode");
            return Ok(submission);
        }

        let mut applicable = Vec::new();
        for profile in self.resolve_profiles(profile_ids).await? {
            if self.builder.should_encode(&profile, media.video_height) {
                applicable.push(profile);
            } else {
                submission.skipped.push(profile.id);
            }
        }

        let (previews, regular): (Vec<_>, Vec<_>) =
            applicable.into_iter().partition(|p| p.is_preview());

        if !regular.is_empty() && self.planner.should_chunk(media.duration) {
            let task = TaskEnvelope::new(
                TaskName::ChunkizeMedia,
                ChunkizeMediaArgs {
                    media_id: media_id.clone(),
                    profile_ids: regular.iter().map(|p| p.id).collect(),
                    force,
                },
            )?
            .with_priority(PRIORITY_HIGH);
            submission.chunk_task = Some(self.enqueue(task).await?);
            info!(media_id = %media_id, profiles = regular.len(), "Queued media for chunking");
        } else {
            for profile in &regular {
                self.queue_into(&mut submission, &media, profile, None, force).await;
            }
        }

        for profile in &previews {
            self.queue_into(&mut submission, &media, profile, None, force).await;
        }

        Ok(submission)
    }

    async fn queue_into(
        &self,
        submission: &mut EncodeSubmission,
        media: &SourceMedia,
        profile: &EncodeProfile,
        chunk: Option<ChunkDescriptor>,
        force: bool,
    ) {
        let priority = chunk_priority(&self.builder, profile.resolution);
        match self.queue_profile(&media.id, profile, chunk, force, priority).await {
            Ok(job) => submission.queued.push(QueuedEncode {
                profile_id: profile.id,
                encoding_id: job.id,
                task_id: job.task_id.unwrap_or_default(),
            }),
            Err(e) => {
                error!(media_id = %media.id, profile = profile.id, error = %e, "Failed to queue encode")
            }
        }
    }

    /// Create a pending job and enqueue its encode task. The task id is
    /// fixed before the record is written so a fast worker never races the
    /// bookkeeping; an enqueue failure deletes the record again.
    pub async fn queue_profile(
        &self,
        media_id: &MediaId,
        profile: &EncodeProfile,
        chunk: Option<ChunkDescriptor>,
        force: bool,
        priority: u8,
    ) -> Result<EncodingJob> {
        let mut job = EncodingJob::pending(media_id.clone(), profile.id, chunk);
        job.retries_remaining = self.config.encoding.max_retries;

        let args = EncodeMediaArgs {
            media_id: media_id.clone(),
            profile_id: profile.id,
            encoding_id: job.id,
            chunk_path: job.chunk.as_ref().map(|c| c.path.clone()),
            force,
        };
        let task = TaskEnvelope::new(TaskName::EncodeMedia, &args)?
            .with_priority(priority)
            .with_correlation(media_id.clone(), profile.id);
        job.task_id = Some(task.task_id.clone());

        self.store.create_job(&job).await?;
        if let Err(e) = self.enqueue(task).await {
            if let Err(del) = self.store.delete_job(job.id).await {
                warn!(encoding_id = %job.id, error = %del, "Failed to delete job after enqueue failure");
            }
            return Err(e);
        }

        debug!(
            media_id = %media_id,
            profile = profile.id,
            encoding_id = %job.id,
            chunk = job.is_chunk(),
            "Queued encode"
        );
        Ok(job)
    }

    /// Segment a long source and queue one encode per (profile, chunk).
    /// Falls back to whole-file encodes when no chunks come out.
    pub async fn chunkize(&self, args: &ChunkizeMediaArgs) -> Result<usize> {
        let media = self.require_media(&args.media_id).await?;
        let profiles: Vec<_> = self
            .resolve_profiles(&args.profile_ids)
            .await?
            .into_iter()
            .filter(|p| self.builder.should_encode(p, media.video_height))
            .collect();

        let manifest = self
            .planner
            .segment(&self.runner, &media.file_path, CancellationToken::new())
            .await;

        let mut submission = EncodeSubmission::default();
        if manifest.is_empty() {
            info!(
                media_id = %media.id,
                "Failed to break file in chunks, queueing whole-file encodes"
            );
            for profile in &profiles {
                self.queue_into(&mut submission, &media, profile, None, args.force)
                    .await;
            }
            return Ok(submission.queued.len());
        }

        let descriptors = manifest.descriptors();
        for profile in &profiles {
            for descriptor in &descriptors {
                self.queue_into(&mut submission, &media, profile, Some(descriptor.clone()), args.force)
                    .await;
            }
        }

        info!(
            media_id = %media.id,
            chunks = manifest.len(),
            profiles = profiles.len(),
            queued = submission.queued.len(),
            "Queued chunk encodes"
        );
        Ok(submission.queued.len())
    }

    /// Revoke a task: its job records are deleted and every worker is told
    /// to stop the process.
    pub async fn revoke_task(&self, task_id: &str) -> Result<usize> {
        let removed = self.store.delete_jobs_by_task(task_id).await?;
        let temp_file = removed.iter().find_map(|j| j.temp_file.clone());

        self.queue
            .revoke(RevokeRequest {
                task_id: task_id.to_string(),
                temp_file,
            })
            .await?;

        let mut media_ids: Vec<_> = removed.iter().map(|j| j.media_id.clone()).collect();
        media_ids.sort();
        media_ids.dedup();
        for media_id in media_ids {
            if let Err(e) = self.refresh_status(&media_id).await {
                warn!(media_id = %media_id, error = %e, "Failed to refresh status after revoke");
            }
        }

        info!(task_id = %task_id, removed = removed.len(), "Revoked task");
        Ok(removed.len())
    }

    /// Recompute and store the aggregate status. Settling on success or
    /// fail publishes a `media.encoded` event.
    pub async fn refresh_status(&self, media_id: &MediaId) -> Result<EncodingStatus> {
        let mut media = self.require_media(media_id).await?;
        let profiles = self.store.list_profiles(true).await?;
        let required = required_profiles(&self.builder, &media, &profiles);
        let jobs = self.store.jobs_for_media(media_id).await?;
        let status = aggregate_status(&media, &jobs, &required);

        if status == media.encoding_status {
            return Ok(status);
        }

        debug!(media_id = %media_id, from = %media.encoding_status, to = %status, "Aggregate status changed");
        media.encoding_status = status;
        media.updated_at = Utc::now();
        self.store.save_media(&media).await?;

        if matches!(status, EncodingStatus::Success | EncodingStatus::Fail) && media.is_video() {
            let mut succeeded: Vec<ProfileId> = jobs
                .iter()
                .filter(|j| j.status == EncodingStatus::Success && !j.is_chunk())
                .map(|j| j.profile_id)
                .collect();
            succeeded.sort_unstable();
            succeeded.dedup();

            let payload = MediaEncodedPayload {
                media_id: media_id.clone(),
                status,
                profiles: succeeded,
                hls_file: media.hls_file.clone(),
            };
            match Event::new(EventType::MediaEncoded, EVENT_SOURCE, payload) {
                Ok(event) => self.publish(event).await,
                Err(e) => warn!(error = %e, "Failed to build media.encoded event"),
            }
        }

        Ok(status)
    }

    /// Follow-up after a job reached success or fail: assemble finished
    /// chunks, refresh HLS and recompute the aggregate.
    pub async fn post_encode_actions(&self, job: &EncodingJob) {
        let mut finished = None;
        if job.status == EncodingStatus::Success {
            if job.is_chunk() {
                match assembler::try_assemble(self, job).await {
                    Ok(assembled) => finished = assembled,
                    Err(e) => {
                        error!(media_id = %job.media_id, profile = job.profile_id, error = %e, "Chunk assembly failed")
                    }
                }
            } else {
                finished = Some(job.clone());
            }
        }

        if let Some(done) = finished.filter(|j| j.status == EncodingStatus::Success) {
            if self.config.artifacts.produce_hls {
                self.queue_hls(&done).await;
            }
        }

        if let Err(e) = self.refresh_status(&job.media_id).await {
            warn!(media_id = %job.media_id, error = %e, "Failed to refresh aggregate status");
        }
    }

    async fn queue_hls(&self, job: &EncodingJob) {
        let profile = match self.store.get_profile(job.profile_id).await {
            Ok(Some(profile)) => profile,
            _ => return,
        };
        if profile.codec != Some(Codec::H264) || profile.extension != Container::Mp4 {
            return;
        }
        let task = match TaskEnvelope::new(
            TaskName::CreateHls,
            MediaTaskArgs {
                media_id: job.media_id.clone(),
            },
        ) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Failed to build HLS task");
                return;
            }
        };
        if let Err(e) = self.enqueue(task).await {
            warn!(media_id = %job.media_id, error = %e, "Failed to queue HLS packaging");
        }
    }

    /// Queue a speech transcription
    pub async fn request_transcription(&self, media_id: &MediaId, translate: bool) -> Result<String> {
        self.require_media(media_id).await?;
        let task = TaskEnvelope::new(
            TaskName::WhisperTranscribe,
            TranscribeArgs {
                media_id: media_id.clone(),
                translate,
            },
        )?;
        self.enqueue(task).await
    }

    /// Per-profile encoding state and the aggregate for one media
    pub async fn media_status(&self, media_id: &MediaId) -> Result<MediaStatus> {
        let media = self.require_media(media_id).await?;
        let jobs = self.store.jobs_for_media(media_id).await?;
        let mut profiles: BTreeMap<ProfileId, EncodeProfile> = self
            .store
            .list_profiles(true)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        for job in &jobs {
            if !profiles.contains_key(&job.profile_id) {
                if let Some(profile) = self.store.get_profile(job.profile_id).await? {
                    profiles.insert(profile.id, profile);
                }
            }
        }

        let views = profiles
            .values()
            .filter(|p| {
                self.builder.should_encode(p, media.video_height)
                    || jobs.iter().any(|j| j.profile_id == p.id)
            })
            .map(|profile| profile_status(profile, &jobs))
            .collect();

        Ok(MediaStatus {
            media_id: media.id.clone(),
            media_type: media.media_type,
            encoding_status: media.encoding_status,
            profiles: views,
            hls_file: media.hls_file,
            sprites: media.sprites,
            poster: media.poster,
        })
    }
}

fn profile_status(profile: &EncodeProfile, jobs: &[EncodingJob]) -> ProfileStatus {
    let own: Vec<&EncodingJob> = jobs.iter().filter(|j| j.profile_id == profile.id).collect();
    let whole = own.iter().filter(|j| !j.is_chunk()).max_by_key(|j| j.updated_at);
    let chunks: Vec<&&EncodingJob> = own.iter().filter(|j| j.is_chunk()).collect();

    let mut view = ProfileStatus {
        profile_id: profile.id,
        profile_name: profile.name.clone(),
        status: None,
        progress: 0.0,
        media_file: None,
        chunks: chunks.len(),
        chunks_done: chunks
            .iter()
            .filter(|j| j.status == EncodingStatus::Success)
            .count(),
        logs: String::new(),
    };

    if let Some(job) = whole {
        view.status = Some(job.status);
        view.progress = job.progress;
        view.media_file = job.media_file.clone();
        view.logs = job.logs.clone();
    } else if !chunks.is_empty() {
        let statuses: Vec<EncodingStatus> = chunks.iter().map(|j| j.status).collect();
        view.status = Some(if statuses.contains(&EncodingStatus::Running) {
            EncodingStatus::Running
        } else if chunks.iter().any(|j| j.is_terminal_failure()) {
            EncodingStatus::Fail
        } else {
            EncodingStatus::Pending
        });
        view.progress = chunks.iter().map(|j| j.progress).sum::<f32>() / chunks.len() as f32;
        view.logs = chunks
            .iter()
            .find(|j| j.status == EncodingStatus::Fail)
            .map(|j| j.logs.clone())
            .unwrap_or_default();
    }
    view
}
