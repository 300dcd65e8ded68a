//! Reconciliation sweeps
//!
//! Periodic passes that repair records left behind by crashed workers,
//! lost queue messages and profiles added after a media was encoded.
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


use crate::chunker::chunk_priority;
use crate::error::{PipelineError, Result};
use crate::jobs::required_profiles;
use crate::pipeline::Pipeline;
use crate::store::MediaFilter;
use chrono::{Duration as ChronoDuration, Utc};
use cinecore_types::{
    EncodeProfile, EncodingJob, EncodingStatus, MediaProfilePair, ProfileId, RevokeRequest,
    SourceMedia, TaskName,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What a sweep looked at and what it changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub changed: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, result: Result<bool>, what: &str) {
        match result {
            Ok(true) => self.changed += 1,
            Ok(false) => {}
            Err(e) => {
                self.errors += 1;
                warn!(sweep = what, error = %e, "Sweep item failed");
            }
        }
    }
}

/// Run the sweep a periodic task names. `None` for non-sweep tasks.
pub async fn run_sweep(p: &Pipeline, name: TaskName) -> Option<Result<SweepReport>> {
    let result = match name {
        TaskName::CheckRunningStates => check_running_states(p).await,
        TaskName::CheckPendingStates => check_pending_states(p).await,
        TaskName::CheckMissingProfiles => check_missing_profiles(p).await,
        TaskName::CheckMediaStates => check_media_states(p).await,
        _ => return None,
    };
    if let Ok(report) = &result {
        if report.changed > 0 || report.errors > 0 {
            info!(
                sweep = name.as_str(),
                examined = report.examined,
                changed = report.changed,
                errors = report.errors,
                "Sweep finished"
            );
        } else {
            debug!(sweep = name.as_str(), examined = report.examined, "Sweep found nothing");
        }
    }
    Some(result)
}

/// Queue a fresh attempt for the slot a removed job held
async fn resubmit(p: &Pipeline, job: &EncodingJob, force: bool) -> Result<bool> {
    let profile = match p.store.get_profile(job.profile_id).await? {
        Some(profile) if profile.active => profile,
        _ => {
            info!(
                media_id = %job.media_id,
                profile = job.profile_id,
                encoding_id = %job.id,
                "Profile no longer active, slot dropped"
            );
            return Ok(false);
        }
    };
    let priority = chunk_priority(&p.builder, profile.resolution);
    p.queue_profile(&job.media_id, &profile, job.chunk.clone(), force, priority)
        .await?;
    Ok(true)
}

async fn requeue_stale(p: &Pipeline, job: &EncodingJob) -> Result<bool> {
    // the delete is what makes exactly one sweep act on the job
    if !p.store.delete_job(job.id).await? {
        return Ok(false);
    }
    warn!(
        media_id = %job.media_id,
        profile = job.profile_id,
        encoding_id = %job.id,
        last_update = %job.updated_at,
        "Stale running job, re-queueing"
    );
    if let Some(task_id) = &job.task_id {
        p.queue
            .revoke(RevokeRequest {
                task_id: task_id.clone(),
                temp_file: job.temp_file.clone(),
            })
            .await
            .map_err(PipelineError::from)?;
    }
    resubmit(p, job, true).await
}

async fn requeue_lost(p: &Pipeline, job: &EncodingJob) -> Result<bool> {
    if !p.store.delete_job(job.id).await? {
        return Ok(false);
    }
    info!(
        media_id = %job.media_id,
        profile = job.profile_id,
        encoding_id = %job.id,
        "Pending job lost its task, re-queueing"
    );
    resubmit(p, job, false).await
}

async fn encode_missing(p: &Pipeline, media: &SourceMedia, required: &[EncodeProfile]) -> Result<bool> {
    let present: BTreeSet<ProfileId> = p
        .store
        .jobs_for_media(&media.id)
        .await?
        .iter()
        .map(|j| j.profile_id)
        .collect();
    let missing: Vec<ProfileId> = required
        .iter()
        .map(|profile| profile.id)
        .filter(|id| !present.contains(id))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }
    info!(media_id = %media.id, missing = ?missing, "Encoding missing profiles");
    p.encode(&media.id, &missing, false).await?;
    Ok(true)
}

/// Running jobs that stopped reporting are revoked and re-queued
pub async fn check_running_states(p: &Pipeline) -> Result<SweepReport> {
    let stale_after = ChronoDuration::seconds(p.config.reconcile.running_stale_secs as i64);
    let cutoff = Utc::now() - stale_after;
    let running = p.store.jobs_with_status(EncodingStatus::Running).await?;

    let mut report = SweepReport::default();
    for job in running {
        report.examined += 1;
        if job.updated_at >= cutoff {
            continue;
        }
        let result = requeue_stale(p, &job).await;
        report.record(result, "running");
    }
    Ok(report)
}

/// Pending jobs whose task the queue no longer knows are re-queued
pub async fn check_pending_states(p: &Pipeline) -> Result<SweepReport> {
    let pending = p.store.jobs_with_status(EncodingStatus::Pending).await?;
    let mut report = SweepReport::default();
    if pending.is_empty() {
        return Ok(report);
    }
    let snapshot = p.queue.inspect().await?;

    for job in pending {
        report.examined += 1;
        if job
            .task_id
            .as_deref()
            .map_or(false, |id| snapshot.contains_task(id))
        {
            continue;
        }
        let pair = MediaProfilePair::new(job.media_id.clone(), job.profile_id);
        if snapshot.contains_pair(&pair) {
            continue;
        }

        let result = requeue_lost(p, &job).await;
        report.record(result, "pending");
    }
    Ok(report)
}

/// Active profiles a video should have but has no record for. Media
/// touched within the settle window are left alone.
pub async fn check_missing_profiles(p: &Pipeline) -> Result<SweepReport> {
    let profiles = p.store.list_profiles(true).await?;
    let videos = p.store.list_media(&MediaFilter::videos()).await?;
    // chunking tasks hold no records yet, give fresh media time to get them
    let settle = ChronoDuration::seconds(p.config.reconcile.missing_profiles_settle_secs as i64);
    let cutoff = Utc::now() - settle;

    let mut report = SweepReport::default();
    for media in videos {
        report.examined += 1;
        if media.updated_at >= cutoff {
            continue;
        }
        let required = required_profiles(&p.builder, &media, &profiles);
        let result = encode_missing(p, &media, &required).await;
        report.record(result, "missing_profiles");
    }
    Ok(report)
}

/// Recompute the aggregate of every media not yet settled on success
pub async fn check_media_states(p: &Pipeline) -> Result<SweepReport> {
    let media = p.store.list_media(&MediaFilter::unsettled()).await?;
    let mut report = SweepReport::default();
    for item in media {
        report.examined += 1;
        let before = item.encoding_status;
        let result = p
            .refresh_status(&item.id)
            .await
            .map(|status| status != before);
        report.record(result, "media_states");
    }
    Ok(report)
}
