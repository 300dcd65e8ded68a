//! Chunk assembly
//!
//! Once every chunk of a profile is encoded, the outputs are concatenated
//! in segment order into one whole-file encode and the chunk records go away.
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


use crate::chunker::{ordered_chunks, remove_chunks};
use crate::command::Invocation;
use crate::encoder::move_file;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use cinecore_types::{Container, EncodingJob, EncodingStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One `file '...'` line per chunk, quotes escaped for the concat demuxer
pub fn concat_list(paths: &[PathBuf]) -> String {
    let mut list = String::new();
    for path in paths {
        let escaped = path.to_string_lossy().replace('\'', "'\\''");
        list.push_str(&format!("file '{}'\n", escaped));
    }
    list
}

pub fn concat_invocation(ffmpeg: &Path, list: &Path, container: Container, output: &Path) -> Invocation {
    let mut cmd = Invocation::new(ffmpeg)
        .args(["-y", "-f", "concat", "-safe", "0", "-i"])
        .path_arg(list)
        .args(["-c", "copy"]);
    if container == Container::Mp4 {
        cmd = cmd.args(["-movflags", "+faststart"]);
    }
    cmd.path_arg(output)
}

/// Try to assemble the profile `finished` belongs to. Returns the
/// whole-file record when assembly ran, `None` while chunks are missing.
pub async fn try_assemble(p: &Pipeline, finished: &EncodingJob) -> Result<Option<EncodingJob>> {
    let chunk = match &finished.chunk {
        Some(chunk) => chunk,
        None => return Ok(None),
    };
    let ordered = ordered_chunks(&chunk.chunks_info);
    if ordered.is_empty() {
        return Ok(None);
    }

    let siblings: Vec<EncodingJob> = p
        .store
        .jobs_for_media(&finished.media_id)
        .await?
        .into_iter()
        .filter(|j| j.profile_id == finished.profile_id && j.is_chunk())
        .collect();

    let done: HashMap<String, &EncodingJob> = siblings
        .iter()
        .filter(|j| j.status == EncodingStatus::Success && j.media_file.is_some())
        .filter_map(|j| j.chunk.as_ref().map(|c| (c.path_key(), j)))
        .collect();

    let mut outputs = Vec::with_capacity(ordered.len());
    let mut claim = None;
    for path in &ordered {
        match done.get(&*path.to_string_lossy()) {
            Some(job) => {
                claim.get_or_insert(job.id);
                outputs.extend(job.media_file.clone());
            }
            None => {
                debug!(
                    media_id = %finished.media_id,
                    profile = finished.profile_id,
                    done = done.len(),
                    total = ordered.len(),
                    "Chunks still encoding"
                );
                return Ok(None);
            }
        }
    }

    let claim = match claim {
        Some(id) => id,
        None => return Ok(None),
    };
    // the first chunk's record is the claim: only the caller whose delete
    // removed it assembles, every other finisher backs off
    if !p.store.delete_job(claim).await? {
        debug!(
            media_id = %finished.media_id,
            profile = finished.profile_id,
            "Assembly already claimed"
        );
        return Ok(None);
    }
    for job in siblings.iter().filter(|j| j.id != claim) {
        p.store.delete_job(job.id).await?;
    }

    let media = p.require_media(&finished.media_id).await?;
    let profile = p
        .store
        .get_profile(finished.profile_id)
        .await?
        .ok_or(PipelineError::ProfileNotFound(finished.profile_id))?;

    let dest = media
        .media_dir(&p.config.paths.media_root)
        .join("encoded")
        .join(profile.id.to_string())
        .join(format!("{}.{}", media.file_stem(), profile.extension.extension()));

    tokio::fs::create_dir_all(&p.config.paths.temp_dir).await?;
    let workdir = tempfile::Builder::new()
        .prefix("concat-")
        .tempdir_in(&p.config.paths.temp_dir)?;
    let list = workdir.path().join("chunks.txt");
    tokio::fs::write(&list, concat_list(&outputs)).await?;
    let tmp_output = workdir
        .path()
        .join(format!("assembled.{}", profile.extension.extension()));
    let invocation = concat_invocation(p.builder.ffmpeg(), &list, profile.extension, &tmp_output);

    let mut whole = EncodingJob::pending(media.id.clone(), profile.id, None);
    whole.retries_remaining = 0;
    whole.start(
        finished.task_id.clone().unwrap_or_default(),
        p.worker_name(),
    )?;
    whole.commands = vec![invocation.render()];
    whole.total_run_time = siblings.iter().map(|j| j.total_run_time).sum();

    let assembled = match p
        .runner
        .run_to_end(&invocation, CancellationToken::new(), |_| {})
        .await
    {
        Ok(tail) => move_file(&tmp_output, &dest)
            .await
            .map(|()| tail)
            .map_err(|e| format!("Failed to move assembled file: {}", e)),
        Err(e) => Err(e.log_text()),
    };

    match assembled {
        Ok(tail) => {
            whole.set_logs(&tail);
            whole.succeed(&dest)?;
            info!(
                media_id = %media.id,
                profile = profile.id,
                chunks = outputs.len(),
                output = %dest.display(),
                "Assembled chunk encodes"
            );
        }
        Err(logs) => {
            error!(media_id = %media.id, profile = profile.id, "Chunk concatenation failed");
            whole.fail(&logs, true)?;
        }
    }

    let existing = p.store.jobs_for_key(&whole.key()).await?;
    if whole.status == EncodingStatus::Fail
        && existing.iter().any(|j| j.status == EncodingStatus::Success)
    {
        warn!(
            media_id = %media.id,
            profile = profile.id,
            "Keeping the existing whole-file encode over a failed assembly"
        );
    } else {
        p.store.replace_active(&whole).await?;
    }

    for job in &siblings {
        if let Some(file) = &job.media_file {
            if let Err(e) = tokio::fs::remove_file(file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %file.display(), error = %e, "Failed to remove chunk output");
                }
            }
        }
    }

    let remaining = p
        .store
        .jobs_for_media(&media.id)
        .await?
        .iter()
        .filter(|j| j.is_chunk())
        .count();
    if remaining == 0 {
        remove_chunks(&chunk.chunks_info).await;
    }

    Ok(Some(whole))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&[
            PathBuf::from("/m/01_a.mp4"),
            PathBuf::from("/m/it's.mp4"),
        ]);
        assert_eq!(list, "file '/m/01_a.mp4'\nfile '/m/it'\\''s.mp4'\n");
    }

    #[test]
    fn test_concat_invocation() {
        let cmd = concat_invocation(
            Path::new("ffmpeg"),
            Path::new("/t/list.txt"),
            Container::Mp4,
            Path::new("/t/out.mp4"),
        );
        assert_eq!(
            cmd.render(),
            "ffmpeg -y -f concat -safe 0 -i /t/list.txt -c copy -movflags +faststart /t/out.mp4"
        );

        let webm = concat_invocation(
            Path::new("ffmpeg"),
            Path::new("/t/list.txt"),
            Container::Webm,
            Path::new("/t/out.webm"),
        );
        assert!(!webm.render().contains("faststart"));
    }
}
