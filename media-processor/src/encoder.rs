//! Encode task handler
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


use crate::command::{EncodePaths, EncodePlan, SourceSpec};
use crate::error::{KillReason, PipelineError, Result, RunnerError, StoreError};
use crate::jobs::ProgressThrottle;
use crate::pipeline::Pipeline;
use crate::probe::file_checksum;
use crate::retry::RetryDecision;
use crate::runner::RunEvent;
use cinecore_types::{
    ChunkDescriptor, EncodeMediaArgs, EncodeProfile, EncodingJob, EncodingStatus, JobKey,
    MediaType, SourceMedia, TaskEnvelope,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Media seconds a preview covers
const PREVIEW_SECONDS: f64 = 25.0;

/// How an encode task ended
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    /// Nothing to do: record gone, already finished or terminally failed
    Skipped,
    /// Another record owns the key
    Superseded,
    Succeeded(PathBuf),
    Failed { permanent: bool, retried: bool },
    /// Stopped by a revocation
    Revoked,
}

/// Run one encode task end to end
pub async fn encode_media(
    p: &Pipeline,
    task: &TaskEnvelope,
    args: &EncodeMediaArgs,
) -> Result<EncodeOutcome> {
    if p.processes.is_revoked(&task.task_id) {
        p.store.delete_job(args.encoding_id).await?;
        return Ok(EncodeOutcome::Revoked);
    }

    let media = p.store.get_media(&args.media_id).await?;
    let profile = p.store.get_profile(args.profile_id).await?;
    let (media, profile) = match (media, profile) {
        (Some(media), Some(profile)) => (media, profile),
        _ => {
            info!(media_id = %args.media_id, profile = args.profile_id, "Media or profile gone, dropping encode");
            p.store.delete_job(args.encoding_id).await?;
            return Ok(EncodeOutcome::Skipped);
        }
    };

    let key = JobKey::new(
        args.media_id.clone(),
        args.profile_id,
        args.chunk_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned()),
    );
    if !args.force {
        let existing = p.store.jobs_for_key(&key).await?;
        if existing.iter().any(|j| j.id != args.encoding_id) {
            debug!(encoding_id = %args.encoding_id, "Key already held by another record");
            p.store.delete_job(args.encoding_id).await?;
            return Ok(EncodeOutcome::Superseded);
        }
    }

    let mut job = match p.store.get_job(args.encoding_id).await? {
        Some(job) => job,
        None => recreate_job(p, args).await?,
    };

    match job.status {
        EncodingStatus::Success => return Ok(EncodeOutcome::Skipped),
        EncodingStatus::Fail if job.retries_remaining == 0 => return Ok(EncodeOutcome::Skipped),
        // redelivered after the previous worker vanished
        EncodingStatus::Running => job.status = EncodingStatus::Pending,
        _ => {}
    }

    job.start(task.task_id.clone(), p.worker_name())?;
    let replaced = p.store.replace_active(&job).await?;
    if replaced > 0 {
        debug!(encoding_id = %job.id, replaced, "Replaced other records of the key");
    }

    info!(
        media_id = %media.id,
        profile = profile.id,
        encoding_id = %job.id,
        chunk = job.is_chunk(),
        attempt = job.retries + 1,
        "Encoding started"
    );

    let started = Instant::now();
    let result = run_encode(p, task, &media, &profile, &mut job).await;
    job.total_run_time += started.elapsed().as_secs();

    match result {
        Ok(Attempt::Done(output)) => finish_success(p, &media, &profile, job, output).await,
        Ok(Attempt::Failed { logs, permanent }) => finish_failure(p, task, job, &logs, permanent).await,
        Ok(Attempt::Revoked) => {
            info!(encoding_id = %job.id, "Encode revoked");
            Ok(EncodeOutcome::Revoked)
        }
        Err(e) => {
            // bookkeeping errors still leave a readable record behind
            error!(encoding_id = %job.id, error = %e, "Encode aborted");
            finish_failure(p, task, job, &e.to_string(), false).await
        }
    }
}

async fn recreate_job(p: &Pipeline, args: &EncodeMediaArgs) -> Result<EncodingJob> {
    let chunk = match &args.chunk_path {
        Some(path) => {
            let path_key = path.to_string_lossy().into_owned();
            let sibling = p
                .store
                .jobs_for_media(&args.media_id)
                .await?
                .into_iter()
                .filter_map(|j| j.chunk)
                .find(|c| c.chunks_info.contains_key(&path_key));
            let checksum = match &sibling {
                Some(c) => c.chunks_info.get(&path_key).cloned().unwrap_or_default(),
                None => file_checksum(path).await.unwrap_or_default(),
            };
            Some(ChunkDescriptor {
                path: path.clone(),
                checksum,
                chunks_info: sibling.map(|c| c.chunks_info).unwrap_or_default(),
            })
        }
        None => None,
    };

    let mut job = EncodingJob::pending(args.media_id.clone(), args.profile_id, chunk);
    job.id = args.encoding_id;
    job.retries_remaining = p.config.encoding.max_retries;
    p.store.create_job(&job).await?;
    warn!(encoding_id = %job.id, "Encoding record missing, recreated");
    Ok(job)
}

enum Attempt {
    Done(PathBuf),
    Failed { logs: String, permanent: bool },
    Revoked,
}

async fn run_encode(
    p: &Pipeline,
    task: &TaskEnvelope,
    media: &SourceMedia,
    profile: &EncodeProfile,
    job: &mut EncodingJob,
) -> Result<Attempt> {
    tokio::fs::create_dir_all(&p.config.paths.temp_dir).await?;
    let workdir = tempfile::Builder::new()
        .prefix("encode-")
        .tempdir_in(&p.config.paths.temp_dir)?;

    let input = match &job.chunk {
        Some(chunk) => chunk.path.clone(),
        None => media.file_path.clone(),
    };
    let output = workdir
        .path()
        .join(format!("{}.{}", job.id, profile.extension.extension()));
    let paths = EncodePaths {
        input,
        output,
        pass_log: workdir.path().join(format!("{}-pass", job.id)),
        chunk: job.is_chunk(),
    };

    let plan = if profile.is_preview() {
        p.builder.preview(profile.id, &paths.input, &paths.output)
    } else {
        let duration = match media.duration {
            Some(d) if d > 0.0 => d,
            _ => {
                return Ok(Attempt::Failed {
                    logs: "Media has no duration".to_string(),
                    permanent: true,
                })
            }
        };
        let info = media.media_info.as_ref();
        let source = SourceSpec {
            height: media.video_height.unwrap_or(0),
            frame_rate: info.map(|i| i.frame_rate).unwrap_or(25.0),
            duration,
            has_audio: info.map(|i| i.has_audio).unwrap_or(true),
        };
        match p.builder.build(profile, &source, &paths) {
            Some(plan) => plan,
            None => {
                return Ok(Attempt::Failed {
                    logs: format!("No encode plan for profile {}", profile.name),
                    permanent: true,
                })
            }
        }
    };

    job.temp_file = Some(plan.output.clone());
    job.commands = plan.rendered();
    if let Err(e) = p.store.update_job(job).await {
        return match e {
            StoreError::NotFound(_) => Ok(Attempt::Revoked),
            other => Err(other.into()),
        };
    }

    let denominator = if profile.is_preview() {
        PREVIEW_SECONDS
    } else if job.is_chunk() {
        p.planner.chunk_duration_secs() as f64
    } else {
        media.duration.unwrap_or(1.0)
    };

    let cancel = p.processes.register(&task.task_id);
    let outcome = run_passes(p, &task.task_id, job, &plan, denominator, cancel).await;
    p.processes.remove(&task.task_id);

    let attempt = match outcome {
        Ok(()) => match validate_output(p, profile, &plan.output).await {
            Ok(()) => {
                let dest = output_path(p, media, profile, job);
                move_file(&plan.output, &dest).await?;
                Attempt::Done(dest)
            }
            Err(reason) => Attempt::Failed {
                logs: reason,
                permanent: false,
            },
        },
        Err(RunnerError::Killed {
            reason: KillReason::Revoked,
            ..
        }) => Attempt::Revoked,
        Err(e @ RunnerError::Killed {
            reason: KillReason::TimedOut,
            ..
        }) => Attempt::Failed {
            logs: e.log_text(),
            permanent: false,
        },
        Err(e) => {
            let logs = e.log_text();
            let permanent = p.classifier.is_permanent(&logs);
            Attempt::Failed { logs, permanent }
        }
    };
    Ok(attempt)
}

/// Percent done across every pass of the plan
pub fn pass_percent(pass: usize, passes: usize, seconds: f64, denominator: f64) -> f32 {
    let passes = passes.max(1) as f64;
    let within = if denominator > 0.0 {
        (seconds * 100.0 / denominator).clamp(0.0, 100.0)
    } else {
        0.0
    };
    ((pass as f64 * 100.0 + within) / passes) as f32
}

async fn run_passes(
    p: &Pipeline,
    task_id: &str,
    job: &mut EncodingJob,
    plan: &EncodePlan,
    denominator: f64,
    cancel: CancellationToken,
) -> std::result::Result<(), RunnerError> {
    let mut throttle = ProgressThrottle::new(p.config.encoding.progress_save_interval);
    let passes = plan.passes.len();
    let mut tail = String::new();

    for (idx, pass) in plan.passes.iter().enumerate() {
        let mut run = p.runner.run(pass, cancel.clone())?;
        p.processes.set_pid(task_id, run.pid());
        let mut finished = false;

        while let Some(event) = run.next().await {
            match event? {
                RunEvent::Progress(token) => {
                    let seconds = match token.seconds {
                        Some(s) => s,
                        None => continue,
                    };
                    let percent = pass_percent(idx, passes, seconds, denominator);
                    if job.record_progress(percent) && throttle.tick() {
                        match p.store.update_job(job).await {
                            Ok(()) => {}
                            Err(StoreError::NotFound(_)) => {
                                // record deleted under us, stop working for nobody
                                cancel.cancel();
                            }
                            Err(e) => warn!(encoding_id = %job.id, error = %e, "Failed to save progress"),
                        }
                    }
                }
                RunEvent::Finished(log) => {
                    tail = log;
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            return Err(RunnerError::NoOutput);
        }
    }

    job.set_logs(&tail);
    Ok(())
}

async fn validate_output(
    p: &Pipeline,
    profile: &EncodeProfile,
    output: &Path,
) -> std::result::Result<(), String> {
    let size = tokio::fs::metadata(output)
        .await
        .map(|m| m.len())
        .map_err(|e| format!("Output missing: {}", e))?;
    if size == 0 {
        return Err("Output file is empty".to_string());
    }

    let outcome = p.prober.probe(output).await.map_err(|e| e.to_string())?;
    let valid = if profile.is_preview() {
        matches!(outcome.media_type, MediaType::Image | MediaType::Video)
    } else {
        matches!(outcome.media_type, MediaType::Video | MediaType::Audio)
    };
    if valid {
        Ok(())
    } else {
        Err(format!(
            "Output is not playable ({})",
            outcome.media_type.as_str()
        ))
    }
}

fn output_path(p: &Pipeline, media: &SourceMedia, profile: &EncodeProfile, job: &EncodingJob) -> PathBuf {
    let stem = match &job.chunk {
        Some(chunk) => chunk
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.id.to_string()),
        None => media.file_stem(),
    };
    media
        .media_dir(&p.config.paths.media_root)
        .join("encoded")
        .join(profile.id.to_string())
        .join(format!("{}.{}", stem, profile.extension.extension()))
}

/// Rename, falling back to copy and delete across file systems
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

async fn finish_success(
    p: &Pipeline,
    media: &SourceMedia,
    profile: &EncodeProfile,
    mut job: EncodingJob,
    output: PathBuf,
) -> Result<EncodeOutcome> {
    job.succeed(&output)?;
    if let Err(e) = p.store.update_job(&job).await {
        if let StoreError::NotFound(_) = e {
            // revoked or superseded right at the finish line
            return Ok(EncodeOutcome::Revoked);
        }
        return Err(e.into());
    }

    info!(
        media_id = %media.id,
        profile = profile.id,
        encoding_id = %job.id,
        seconds = job.total_run_time,
        output = %output.display(),
        "Encoding succeeded"
    );
    p.post_encode_actions(&job).await;
    Ok(EncodeOutcome::Succeeded(output))
}

async fn finish_failure(
    p: &Pipeline,
    task: &TaskEnvelope,
    mut job: EncodingJob,
    logs: &str,
    permanent: bool,
) -> Result<EncodeOutcome> {
    job.fail(logs, permanent)?;
    match p.store.update_job(&job).await {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => return Ok(EncodeOutcome::Revoked),
        Err(e) => return Err(PipelineError::Store(e)),
    }

    warn!(
        media_id = %job.media_id,
        profile = job.profile_id,
        encoding_id = %job.id,
        permanent,
        retries_remaining = job.retries_remaining,
        "Encoding failed"
    );

    let mut retried = false;
    if let RetryDecision::Retry(countdown) = p.retry_policy.decide(permanent, job.retries_remaining) {
        match p.enqueue(task.retry(countdown.as_secs())).await {
            Ok(_) => retried = true,
            Err(e) => {
                error!(encoding_id = %job.id, error = %e, "Failed to schedule retry, failing for good");
                // nothing will ever start the retry, so the failure is terminal
                job.retries_remaining = 0;
                match p.store.update_job(&job).await {
                    Ok(()) => {}
                    Err(StoreError::NotFound(_)) => return Ok(EncodeOutcome::Revoked),
                    Err(e) => return Err(PipelineError::Store(e)),
                }
            }
        }
    }

    if !retried {
        p.post_encode_actions(&job).await;
    }
    Ok(EncodeOutcome::Failed { permanent, retried })
}
