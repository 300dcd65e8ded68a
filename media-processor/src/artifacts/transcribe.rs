//! Speech transcription into WebVTT subtitles
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
use crate::error::Result;
use crate::pipeline::{Pipeline, EVENT_SOURCE};
use cinecore_types::{
    Event, EventType, MediaTranscribedPayload, SourceMedia, Subtitle, TranscribeArgs,
    TranscriptionRequest,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionOutcome {
    /// Another request for the same (media, translate) exists
    AlreadyRequested,
    /// Not a transcribable media
    Skipped,
    Subtitle(PathBuf),
}

/// Language the subtitle is stored under
pub fn language_code(translate: bool) -> &'static str {
    if translate {
        "automatic-translation"
    } else {
        "automatic"
    }
}

/// 16 kHz mono PCM, the input whisper expects
pub fn audio_invocation(ffmpeg: &Path, input: &Path, wav: &Path) -> Invocation {
    Invocation::new(ffmpeg)
        .args(["-y", "-i"])
        .path_arg(input)
        .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
        .path_arg(wav)
}

/// Whisper writes `<output_base>.vtt`
pub fn whisper_invocation(
    whisper: &Path,
    model: &Path,
    wav: &Path,
    translate: bool,
    output_base: &Path,
) -> Invocation {
    let mut cmd = Invocation::new(whisper)
        .arg("-m")
        .path_arg(model)
        .args([
            "--entropy-thold",
            "2.8",
            "--max-context",
            "0",
            "--language",
            "auto",
            "-f",
        ])
        .path_arg(wav);
    if translate {
        cmd = cmd.arg("--translate");
    }
    cmd.args(["--output-vtt", "--output-file"]).path_arg(output_base)
}

/// Transcribe a media at most once per (media, translate)
pub async fn whisper_transcribe(
    p: &Pipeline,
    args: &TranscribeArgs,
    cancel: &CancellationToken,
) -> Result<TranscriptionOutcome> {
    let (whisper, model) = p.config.whisper()?;
    let media = p.require_media(&args.media_id).await?;
    if media.media_info.as_ref().map_or(false, |i| !i.has_audio) {
        info!(media_id = %media.id, "No audio stream, nothing to transcribe");
        return Ok(TranscriptionOutcome::Skipped);
    }

    if p.store.transcription_exists(&media.id, args.translate).await? {
        return Ok(TranscriptionOutcome::AlreadyRequested);
    }
    let request = TranscriptionRequest::new(media.id.clone(), args.translate);
    if !p.store.create_transcription(&request).await? {
        return Ok(TranscriptionOutcome::AlreadyRequested);
    }

    let language = language_code(args.translate);
    match transcribe(p, &media, &whisper, &model, args.translate, language, cancel).await {
        Ok(subtitle) => {
            let payload = MediaTranscribedPayload {
                media_id: media.id.clone(),
                language_code: language.to_string(),
                subtitle_file: subtitle.file.clone(),
                translate: args.translate,
            };
            match Event::new(EventType::MediaTranscribed, EVENT_SOURCE, payload) {
                Ok(event) => p.publish(event).await,
                Err(e) => error!(error = %e, "Failed to build media.transcribed event"),
            }
            info!(media_id = %media.id, language, file = %subtitle.file.display(), "Transcription saved");
            Ok(TranscriptionOutcome::Subtitle(subtitle.file))
        }
        Err(e) => {
            error!(media_id = %media.id, translate = args.translate, error = %e, "Transcription failed");
            // a failed run must not block the next request
            p.store.delete_transcription(&media.id, args.translate).await?;
            Err(e)
        }
    }
}

async fn transcribe(
    p: &Pipeline,
    media: &SourceMedia,
    whisper: &Path,
    model: &Path,
    translate: bool,
    language: &str,
    cancel: &CancellationToken,
) -> Result<Subtitle> {
    tokio::fs::create_dir_all(&p.config.paths.temp_dir).await?;
    let workdir = tempfile::Builder::new()
        .prefix("whisper-")
        .tempdir_in(&p.config.paths.temp_dir)?;
    let stem = media.file_stem();
    let wav = workdir.path().join(format!("{}.wav", stem));
    let output_base = workdir.path().join(&stem);

    run_tool(p, &audio_invocation(p.builder.ffmpeg(), &media.file_path, &wav), cancel).await?;
    run_tool(
        p,
        &whisper_invocation(whisper, model, &wav, translate, &output_base),
        cancel,
    )
    .await?;

    let vtt = workdir.path().join(format!("{}.vtt", stem));
    let dir = media.media_dir(&p.config.paths.media_root).join("subtitles");
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(format!("{}.vtt", language));
    tokio::fs::copy(&vtt, &dest).await?;

    let subtitle = Subtitle::new(media.id.clone(), language, &dest);
    if let Err(e) = p.store.save_subtitle(&subtitle).await {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(e.into());
    }
    Ok(subtitle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whisper_invocation_order() {
        let cmd = whisper_invocation(
            Path::new("whisper"),
            Path::new("/models/base.bin"),
            Path::new("/t/clip.wav"),
            true,
            Path::new("/t/clip"),
        );
        assert_eq!(
            cmd.render(),
            "whisper -m /models/base.bin --entropy-thold 2.8 --max-context 0 --language auto \
             -f /t/clip.wav --translate --output-vtt --output-file /t/clip"
        );
    }

    #[test]
    fn test_language_code() {
        assert_eq!(language_code(false), "automatic");
        assert_eq!(language_code(true), "automatic-translation");
    }

    #[test]
    fn test_audio_invocation() {
        let cmd = audio_invocation(Path::new("ffmpeg"), Path::new("/m/a.mp4"), Path::new("/t/a.wav"));
        assert_eq!(
            cmd.render(),
            "ffmpeg -y -i /m/a.mp4 -ar 16000 -ac 1 -c:a pcm_s16le /t/a.wav"
        );
    }
}
