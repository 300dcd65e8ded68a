//! Poster frame
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
use crate::pipeline::Pipeline;
use chrono::Utc;
use cinecore_types::SourceMedia;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Single JPEG frame a third of the way in
pub fn poster_invocation(ffmpeg: &Path, input: &Path, duration: f64, output: &Path) -> Invocation {
    let offset = format!("{:.2}", (duration / 3.0).max(0.0));
    Invocation::new(ffmpeg)
        .args(["-y", "-ss", offset.as_str(), "-i"])
        .path_arg(input)
        .args(["-vframes", "1", "-q:v", "2"])
        .path_arg(output)
}

/// Best effort: a missing poster never fails media initialization
pub async fn produce_poster(p: &Pipeline, media: &SourceMedia) {
    let dir = media.media_dir(&p.config.paths.media_root);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(media_id = %media.id, error = %e, "Failed to create media directory");
        return;
    }
    let output = dir.join("poster.jpg");
    let invocation = poster_invocation(
        p.builder.ffmpeg(),
        &media.file_path,
        media.duration.unwrap_or(0.0),
        &output,
    );

    if let Err(e) = run_tool(p, &invocation, &CancellationToken::new()).await {
        warn!(media_id = %media.id, error = %e, "Poster extraction failed");
        return;
    }
    if !output.exists() {
        return;
    }

    // re-read, the record may have moved on while ffmpeg ran
    match p.store.get_media(&media.id).await {
        Ok(Some(mut fresh)) => {
            fresh.poster = Some(output.clone());
            fresh.updated_at = Utc::now();
            match p.store.save_media(&fresh).await {
                Ok(()) => info!(media_id = %media.id, poster = %output.display(), "Poster saved"),
                Err(e) => warn!(media_id = %media.id, error = %e, "Failed to save poster"),
            }
        }
        Ok(None) => {}
        Err(e) => warn!(media_id = %media.id, error = %e, "Failed to reload media"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poster_offset() {
        let cmd = poster_invocation(
            Path::new("ffmpeg"),
            Path::new("/m/in.mp4"),
            90.0,
            Path::new("/m/poster.jpg"),
        );
        assert_eq!(
            cmd.render(),
            "ffmpeg -y -ss 30.00 -i /m/in.mp4 -vframes 1 -q:v 2 /m/poster.jpg"
        );
    }
}
