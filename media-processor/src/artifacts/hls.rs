//! HLS packaging of the h264 renditions
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


use super::run_tool;
use crate::command::Invocation;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use chrono::Utc;
use cinecore_config::require_executable;
use cinecore_types::{Codec, Container, EncodingStatus, MediaId};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const MASTER_PLAYLIST: &str = "master.m3u8";

pub fn mp4hls_invocation(mp4hls: &Path, segment_duration: u32, output_dir: &Path, files: &[PathBuf]) -> Invocation {
    let mut cmd = Invocation::new(mp4hls).args([
        format!("--segment-duration={}", segment_duration),
        format!("--output-dir={}", output_dir.display()),
    ]);
    for file in files {
        cmd = cmd.path_arg(file);
    }
    cmd
}

/// Package every successful whole-file h264 mp4 rendition. An existing
/// package is rebuilt beside the old one and swapped in.
pub async fn create_hls(
    p: &Pipeline,
    media_id: &MediaId,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>> {
    let mp4hls = require_executable(&p.config.tools.mp4hls)?;
    let media = p.require_media(media_id).await?;

    let mut files = Vec::new();
    for job in p.store.jobs_for_media(media_id).await? {
        if job.status != EncodingStatus::Success || job.is_chunk() {
            continue;
        }
        let file = match job.media_file {
            Some(file) => file,
            None => continue,
        };
        if let Some(profile) = p.store.get_profile(job.profile_id).await? {
            if profile.codec == Some(Codec::H264) && profile.extension == Container::Mp4 {
                files.push(file);
            }
        }
    }
    if files.is_empty() {
        return Ok(None);
    }
    files.sort();

    let target = p.config.paths.hls_root.join(media.uid.simple().to_string());
    tokio::fs::create_dir_all(&p.config.paths.hls_root).await?;
    let existing = tokio::fs::metadata(&target).await.is_ok();
    let build_dir = if existing {
        p.config
            .paths
            .hls_root
            .join(format!("{}-{}", media.uid.simple(), &Uuid::new_v4().simple().to_string()[..8]))
    } else {
        target.clone()
    };

    let invocation = mp4hls_invocation(
        &mp4hls,
        p.config.artifacts.hls_segment_duration,
        &build_dir,
        &files,
    );
    if let Err(e) = run_tool(p, &invocation, cancel).await {
        warn!(media_id = %media_id, error = %e, "HLS packaging failed");
        let _ = tokio::fs::remove_dir_all(&build_dir).await;
        return Ok(None);
    }

    if existing {
        swap_dirs(&build_dir, &target).await?;
    }

    let master = target.join(MASTER_PLAYLIST);
    if tokio::fs::metadata(&master).await.is_err() {
        warn!(media_id = %media_id, dir = %target.display(), "No master playlist produced");
        return Ok(None);
    }

    let mut fresh = p
        .store
        .get_media(media_id)
        .await?
        .ok_or_else(|| PipelineError::MediaNotFound(media_id.clone()))?;
    if fresh.hls_file.as_deref() != Some(master.as_path()) {
        fresh.hls_file = Some(master.clone());
        fresh.updated_at = Utc::now();
        p.store.save_media(&fresh).await?;
    }

    info!(media_id = %media_id, renditions = files.len(), playlist = %master.display(), "HLS package ready");
    Ok(Some(master))
}

async fn swap_dirs(fresh: &Path, target: &Path) -> std::io::Result<()> {
    let mut retired = target.as_os_str().to_owned();
    retired.push(".old");
    let retired = PathBuf::from(retired);
    let _ = tokio::fs::remove_dir_all(&retired).await;

    tokio::fs::rename(target, &retired).await?;
    if let Err(e) = tokio::fs::rename(fresh, target).await {
        // put the old package back
        tokio::fs::rename(&retired, target).await?;
        return Err(e);
    }
    tokio::fs::remove_dir_all(&retired).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp4hls_invocation() {
        let cmd = mp4hls_invocation(
            Path::new("/opt/bento4/mp4hls"),
            4,
            Path::new("/hls/abc"),
            &[PathBuf::from("/m/240.mp4"), PathBuf::from("/m/480.mp4")],
        );
        assert_eq!(
            cmd.render(),
            "/opt/bento4/mp4hls --segment-duration=4 --output-dir=/hls/abc /m/240.mp4 /m/480.mp4"
        );
    }

    #[tokio::test]
    async fn test_swap_dirs_replaces_content() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("pkg");
        let fresh = root.path().join("pkg-new");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::create_dir_all(&fresh).unwrap();
        std::fs::write(target.join("old.ts"), b"old").unwrap();
        std::fs::write(fresh.join(MASTER_PLAYLIST), b"#EXTM3U").unwrap();

        swap_dirs(&fresh, &target).await.unwrap();

        assert!(target.join(MASTER_PLAYLIST).exists());
        assert!(!target.join("old.ts").exists());
        assert!(!fresh.exists());
    }
}
