//! Sprite sheet of evenly spaced thumbnails
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
use cinecore_types::MediaId;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Thumbnails are 160x90, one every `interval` seconds
pub fn sprite_invocations(
    ffmpeg: &Path,
    input: &Path,
    interval: u32,
    frames_dir: &Path,
    count: usize,
    output: &Path,
) -> (Invocation, Invocation) {
    let pattern = frames_dir.join("img%03d.jpg");
    let extract = Invocation::new(ffmpeg)
        .args(["-y", "-i"])
        .path_arg(input)
        .args([
            "-f".to_string(),
            "image2".to_string(),
            "-vf".to_string(),
            format!("fps=1/{},scale=160:90", interval.max(1)),
        ])
        .path_arg(&pattern);
    let tile = Invocation::new(ffmpeg)
        .args(["-y", "-framerate", "1", "-i"])
        .path_arg(&pattern)
        .args([
            "-vf".to_string(),
            format!("tile=1x{}", count.max(1)),
            "-frames:v".to_string(),
            "1".to_string(),
        ])
        .path_arg(output);
    (extract, tile)
}

async fn count_frames(dir: &Path) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("img") && name.ends_with(".jpg") {
            count += 1;
        }
    }
    Ok(count)
}

/// Build the sprite sheet. Tool failures are logged and yield `None`.
pub async fn produce_sprite(
    p: &Pipeline,
    media_id: &MediaId,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>> {
    let media = p.require_media(media_id).await?;
    if !media.is_video() {
        return Ok(None);
    }

    tokio::fs::create_dir_all(&p.config.paths.temp_dir).await?;
    let workdir = tempfile::Builder::new()
        .prefix("sprite-")
        .tempdir_in(&p.config.paths.temp_dir)?;
    let dir = media.media_dir(&p.config.paths.media_root);
    tokio::fs::create_dir_all(&dir).await?;
    let output = dir.join("sprites.jpg");
    let interval = p.config.artifacts.sprite_interval_secs;

    let (extract, _) = sprite_invocations(
        p.builder.ffmpeg(),
        &media.file_path,
        interval,
        workdir.path(),
        0,
        &output,
    );
    if let Err(e) = run_tool(p, &extract, cancel).await {
        warn!(media_id = %media_id, error = %e, "Sprite frame extraction failed");
        return Ok(None);
    }

    let count = count_frames(workdir.path()).await?;
    if count == 0 {
        warn!(media_id = %media_id, "No sprite frames extracted");
        return Ok(None);
    }
    let (_, tile) = sprite_invocations(
        p.builder.ffmpeg(),
        &media.file_path,
        interval,
        workdir.path(),
        count,
        &output,
    );
    if let Err(e) = run_tool(p, &tile, cancel).await {
        warn!(media_id = %media_id, error = %e, "Sprite tiling failed");
        return Ok(None);
    }
    if !output.exists() {
        return Ok(None);
    }

    let mut fresh = p
        .store
        .get_media(media_id)
        .await?
        .ok_or_else(|| PipelineError::MediaNotFound(media_id.clone()))?;
    fresh.sprites = Some(output.clone());
    fresh.updated_at = Utc::now();
    p.store.save_media(&fresh).await?;

    info!(media_id = %media_id, frames = count, "Sprite sheet saved");
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprite_invocations() {
        let (extract, tile) = sprite_invocations(
            Path::new("ffmpeg"),
            Path::new("/m/in.mp4"),
            10,
            Path::new("/t"),
            12,
            Path::new("/m/sprites.jpg"),
        );
        assert_eq!(
            extract.render(),
            "ffmpeg -y -i /m/in.mp4 -f image2 -vf fps=1/10,scale=160:90 /t/img%03d.jpg"
        );
        assert_eq!(
            tile.render(),
            "ffmpeg -y -framerate 1 -i /t/img%03d.jpg -vf tile=1x12 -frames:v 1 /m/sprites.jpg"
        );
    }
}
