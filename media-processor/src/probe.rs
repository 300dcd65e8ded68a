//! Media probing with ffprobe
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


use crate::error::{PipelineError, Result};
use cinecore_types::{MediaInfo, MediaType};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Containers ffprobe reports for still images and raw text
pub const IMAGE_FORMATS: [&str; 6] = ["tty", "image2", "image2pipe", "bin", "png_pipe", "gif"];

#[derive(Debug, Deserialize, Default)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<StreamEntry>,
    #[serde(default)]
    format: Option<FormatEntry>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct StreamEntry {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct FormatEntry {
    format_name: Option<String>,
    duration: Option<String>,
}

/// Result of probing one file
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub media_type: MediaType,
    pub info: MediaInfo,
}

/// Parsed ffprobe stream report, before any follow-up calls
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub media_type: MediaType,
    pub info: MediaInfo,
    /// Video bitrate must be recomputed from packet sizes
    pub needs_packet_bitrate: bool,
}

/// Parse an `N/D` or plain frame rate
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let value = value.trim();
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Parse a matroska style `HH:MM:SS.fraction` duration tag
pub fn parse_tag_duration(value: &str) -> Option<f64> {
    let (hms, fraction) = value
        .split_once('.')
        .or_else(|| value.split_once(','))
        .unwrap_or((value, "0"));

    let mut total = 0.0;
    for (i, part) in hms.split(':').rev().enumerate() {
        let n: f64 = part.trim().parse().ok()?;
        total += n * 60f64.powi(i as i32);
    }
    let fraction: f64 = format!("0.{}", fraction.trim()).parse().ok()?;
    Some(total + fraction)
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Duration from the stream, its DURATION tag, then the container
fn stream_duration(stream: &StreamEntry, format: Option<&FormatEntry>) -> Option<f64> {
    parse_seconds(stream.duration.as_ref())
        .or_else(|| stream.tags.get("DURATION").and_then(|d| parse_tag_duration(d)))
        .or_else(|| format.and_then(|f| parse_seconds(f.duration.as_ref())))
}

fn kbits(bit_rate: Option<&String>) -> Option<f64> {
    parse_seconds(bit_rate)
        .filter(|rate| *rate > 0.0)
        .map(|rate| round2(rate / 1024.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn is_image_format(format_name: &str) -> bool {
    format_name
        .split(',')
        .any(|name| IMAGE_FORMATS.contains(&name.trim()))
}

/// Interpret `-show_streams -of json` output
pub fn parse_stream_report(json: &str) -> std::result::Result<StreamReport, String> {
    let probe: ProbeOutput =
        serde_json::from_str(json).map_err(|e| format!("unreadable ffprobe output: {}", e))?;
    let format = probe.format.as_ref();

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let mut info = MediaInfo {
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        ..MediaInfo::default()
    };

    if let Some(audio) = audio {
        info.audio_codec = audio.codec_name.clone();
        info.audio_bitrate = kbits(audio.bit_rate.as_ref());
        info.audio_sample_rate = audio.sample_rate.as_ref().and_then(|r| r.parse().ok());
        info.audio_channels = audio.channels;
    }

    let image = format
        .and_then(|f| f.format_name.as_deref())
        .map(is_image_format)
        .unwrap_or(false);

    let Some(video) = video else {
        if let Some(audio) = audio {
            info.duration = stream_duration(audio, format).unwrap_or_default();
            return Ok(StreamReport {
                media_type: MediaType::Audio,
                info,
                needs_packet_bitrate: false,
            });
        }
        return Ok(StreamReport {
            media_type: MediaType::Other,
            info,
            needs_packet_bitrate: false,
        });
    };

    info.width = video.width.unwrap_or_default();
    info.height = video.height.unwrap_or_default();
    info.video_codec = video.codec_name.clone();

    if image {
        return Ok(StreamReport {
            media_type: MediaType::Image,
            info,
            needs_packet_bitrate: false,
        });
    }

    info.duration = stream_duration(video, format).ok_or("no duration in streams or container")?;
    info.frame_rate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or_default();

    let bitrate = kbits(video.bit_rate.as_ref());
    info.video_bitrate = bitrate.unwrap_or_default();

    Ok(StreamReport {
        media_type: MediaType::Video,
        info,
        needs_packet_bitrate: bitrate.is_none(),
    })
}

/// Bitrate in kbit/s from `packet=size` compact output
pub fn packet_bitrate(output: &str, duration: f64) -> Option<f64> {
    if duration <= 0.0 {
        return None;
    }
    let bytes: u64 = output
        .lines()
        .map(|line| line.trim().trim_end_matches('|'))
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.parse::<u64>().ok())
        .sum();
    Some(round2(bytes as f64 * 8.0 / 1024.0 / duration))
}

/// Streaming SHA-256 of a file, hex encoded
pub async fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Runs ffprobe against source files
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe: PathBuf,
}

impl Prober {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }

    async fn ffprobe(&self, path: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.ffprobe)
            .args(args)
            .arg(path)
            .output()
            .await
            .map_err(|e| PipelineError::Probe {
                path: path.to_path_buf(),
                reason: format!("Failed to run ffprobe: {}", e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::Probe {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Probe a file for type, duration, geometry and codecs
    pub async fn probe(&self, path: &Path) -> Result<ProbeOutcome> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| PipelineError::Probe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::Probe {
                path: path.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }

        let json = self
            .ffprobe(
                path,
                &[
                    "-loglevel",
                    "error",
                    "-show_streams",
                    "-show_entries",
                    "format=format_name,duration",
                    "-of",
                    "json",
                ],
            )
            .await?;

        let report = parse_stream_report(&json).map_err(|reason| PipelineError::Probe {
            path: path.to_path_buf(),
            reason,
        })?;
        let mut info = report.info;

        if report.needs_packet_bitrate {
            debug!(path = %path.display(), "No stream bitrate, summing packet sizes");
            let packets = self
                .ffprobe(
                    path,
                    &[
                        "-loglevel",
                        "error",
                        "-select_streams",
                        "v",
                        "-show_entries",
                        "packet=size",
                        "-of",
                        "compact=p=0:nk=1",
                    ],
                )
                .await;
            match packets {
                Ok(out) => {
                    info.video_bitrate = packet_bitrate(&out, info.duration).unwrap_or_default()
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Packet size scan failed"),
            }
        }

        info.file_size = metadata.len();
        match file_checksum(path).await {
            Ok(sum) => info.checksum = Some(sum),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to checksum file"),
        }

        info!(
            path = %path.display(),
            media_type = report.media_type.as_str(),
            duration = info.duration,
            height = info.height,
            "Probed media file"
        );

        Ok(ProbeOutcome {
            media_type: report.media_type,
            info,
        })
    }
}
