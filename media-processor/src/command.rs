//! Encoder command construction
//!
//! Maps an encode profile and probed source metadata to the ffmpeg
//! invocations that produce it. Nothing here touches the filesystem.
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


use cinecore_config::PipelineConfig;
use cinecore_types::{Codec, Container, EncodeProfile, ProfileId};
use std::path::{Path, PathBuf};

/// Seconds between forced keyframes
pub const KEYFRAME_DISTANCE: u32 = 4;
pub const MAX_RATE_MULTIPLIER: f64 = 1.5;
pub const BUF_SIZE_MULTIPLIER: f64 = 1.5;
/// Highest frame rate handed to the muxer
pub const MAX_FPS: u32 = 90;

/// One external process to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command line as stored on job records
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// How the video bitrate is controlled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// Single pass constant rate factor
    Crf,
    /// Analysis pass to the null muxer, then the real encode
    TwoPass,
    /// Animated GIF preview
    Preview,
}

/// Everything needed to produce one profile output
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub profile_id: ProfileId,
    pub mode: EncodingMode,
    pub passes: Vec<Invocation>,
    /// File the last pass writes
    pub output: PathBuf,
}

impl EncodePlan {
    pub fn rendered(&self) -> Vec<String> {
        self.passes.iter().map(Invocation::render).collect()
    }
}

/// Probed properties of the file being encoded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceSpec {
    pub height: u32,
    pub frame_rate: f64,
    pub duration: f64,
    pub has_audio: bool,
}

/// Files an encode reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePaths {
    pub input: PathBuf,
    pub output: PathBuf,
    pub pass_log: PathBuf,
    pub chunk: bool,
}

fn encoder_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "libx264",
        Codec::H265 => "libx265",
        Codec::Vp9 => "libvpx-vp9",
    }
}

fn audio_encoder(codec: Codec) -> (&'static str, u32) {
    match codec {
        Codec::H264 | Codec::H265 => ("aac", 128),
        Codec::Vp9 => ("libopus", 96),
    }
}

fn crf_value(codec: Codec) -> u32 {
    match codec {
        Codec::H264 => 23,
        Codec::H265 => 28,
        Codec::Vp9 => 32,
    }
}

/// Container an encoder writes
pub fn container_for(codec: Codec) -> Container {
    match codec {
        Codec::Vp9 => Container::Webm,
        Codec::H264 | Codec::H265 => Container::Mp4,
    }
}

/// Target video bitrate in kbit/s for (codec, frame-rate bucket, height)
fn bitrate_table(codec: Codec, bucket: u32, resolution: u32) -> Option<u32> {
    let rate = match (codec, bucket) {
        (Codec::H264, 25) => match resolution {
            240 => 300,
            360 => 500,
            480 => 1000,
            720 => 2500,
            1080 => 4500,
            1440 => 9000,
            2160 => 18000,
            _ => return None,
        },
        (Codec::H264, 60) => match resolution {
            720 => 3500,
            1080 => 7500,
            1440 => 18000,
            2160 => 40000,
            _ => return None,
        },
        (Codec::H265 | Codec::Vp9, 25) => match resolution {
            240 => 150,
            360 => 275,
            480 => 500,
            720 => 1024,
            1080 => 1800,
            1440 => 4500,
            2160 => 10000,
            _ => return None,
        },
        (Codec::H265 | Codec::Vp9, 60) => match resolution {
            720 => 1800,
            1080 => 3000,
            1440 => 8000,
            2160 => 18000,
            _ => return None,
        },
        _ => return None,
    };
    Some(rate)
}

/// Sources up to 30 fps use the 25 bucket; faster ones the 60 bucket,
/// falling back to the 25 bucket for heights it lacks.
pub fn target_bitrate(codec: Codec, frame_rate: f64, resolution: u32) -> Option<u32> {
    if frame_rate <= 30.0 {
        bitrate_table(codec, 25, resolution)
    } else {
        bitrate_table(codec, 60, resolution).or_else(|| bitrate_table(codec, 25, resolution))
    }
}

/// Fractional rates are rounded up, then clamped
pub fn target_fps(frame_rate: f64) -> u32 {
    let fps = if frame_rate.is_finite() && frame_rate > 0.0 {
        frame_rate.ceil() as u32
    } else {
        30
    };
    fps.clamp(1, MAX_FPS)
}

/// Builds encode plans
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    minimum_resolutions: Vec<u32>,
    crf_threshold_secs: f64,
}

impl CommandBuilder {
    pub fn new(ffmpeg: impl Into<PathBuf>, minimum_resolutions: Vec<u32>, crf_threshold_secs: f64) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            minimum_resolutions,
            crf_threshold_secs,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.tools.ffmpeg.clone(),
            config.encoding.minimum_resolutions.clone(),
            config.encoding.crf_threshold_secs as f64,
        )
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    /// Resolutions always produced, even above the source height
    pub fn is_minimum_resolution(&self, resolution: u32) -> bool {
        self.minimum_resolutions.contains(&resolution)
    }

    /// Whether a profile applies to a source of this height
    pub fn should_encode(&self, profile: &EncodeProfile, source_height: Option<u32>) -> bool {
        if profile.is_preview() {
            return true;
        }
        match source_height {
            Some(height) if height < profile.resolution => {
                self.is_minimum_resolution(profile.resolution)
            }
            _ => true,
        }
    }

    pub fn mode_for(&self, duration: f64) -> EncodingMode {
        if duration > self.crf_threshold_secs {
            EncodingMode::Crf
        } else {
            EncodingMode::TwoPass
        }
    }

    /// Plan a profile for a source. `None` when the profile has no table
    /// entry, no codec, or sits above the source height outside the
    /// allow-list.
    pub fn build(
        &self,
        profile: &EncodeProfile,
        source: &SourceSpec,
        paths: &EncodePaths,
    ) -> Option<EncodePlan> {
        if profile.is_preview() {
            return Some(self.preview(profile.id, &paths.input, &paths.output));
        }

        let codec = profile.codec?;
        let bitrate = target_bitrate(codec, source.frame_rate, profile.resolution)?;
        if !self.should_encode(profile, Some(source.height)) {
            return None;
        }

        let mode = self.mode_for(source.duration);
        let pass_numbers: &[u32] = match mode {
            EncodingMode::TwoPass => &[1, 2],
            _ => &[2],
        };

        let passes = pass_numbers
            .iter()
            .map(|&pass| self.pass(codec, profile.resolution, bitrate, source, paths, mode, pass))
            .collect();

        Some(EncodePlan {
            profile_id: profile.id,
            mode,
            passes,
            output: paths.output.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn pass(
        &self,
        codec: Codec,
        height: u32,
        bitrate: u32,
        source: &SourceSpec,
        paths: &EncodePaths,
        mode: EncodingMode,
        pass: u32,
    ) -> Invocation {
        let fps = target_fps(source.frame_rate);
        let encoder = encoder_name(codec);
        let keyframe_distance = fps * KEYFRAME_DISTANCE;
        let max_rate = (bitrate as f64 * MAX_RATE_MULTIPLIER) as u32;
        let buf_size = (bitrate as f64 * BUF_SIZE_MULTIPLIER) as u32;
        let force_key_frames = format!("expr:gte(t,n_forced*{})", KEYFRAME_DISTANCE);
        let pass_log = paths.pass_log.to_string_lossy().into_owned();
        let two_pass = mode == EncodingMode::TwoPass;
        let preset = if height >= 720 { "faster" } else { "medium" };

        let mut cmd = Invocation::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .path_arg(&paths.input)
            .args(["-c:v", encoder])
            .arg("-filter:v")
            .arg(format!("scale=-2:{},fps=fps={}", height, fps))
            .args(["-pix_fmt", "yuv420p"]);

        if two_pass {
            cmd = cmd.arg("-b:v").arg(format!("{}k", bitrate));
        } else {
            cmd = cmd.arg("-crf").arg(crf_value(codec).to_string());
            if codec == Codec::Vp9 {
                cmd = cmd.arg("-b:v").arg(format!("{}k", bitrate));
            }
        }

        if source.has_audio {
            let (audio, audio_rate) = audio_encoder(codec);
            cmd = cmd
                .args(["-c:a", audio])
                .arg("-b:a")
                .arg(format!("{}k", audio_rate))
                .args(["-ac", "2"]);
        }

        match codec {
            Codec::H264 => {
                let level = if height <= 1080 { "4.2" } else { "5.2" };
                cmd = cmd
                    .arg("-maxrate")
                    .arg(format!("{}k", max_rate))
                    .arg("-bufsize")
                    .arg(format!("{}k", buf_size))
                    .arg("-force_key_frames")
                    .arg(force_key_frames)
                    .arg("-x264-params")
                    .arg(format!(
                        "keyint={}:keyint_min={}",
                        keyframe_distance * 2,
                        keyframe_distance
                    ))
                    .args(["-preset", preset, "-profile:v", "main", "-level", level]);
                if two_pass {
                    cmd = cmd
                        .args(["-passlogfile", pass_log.as_str()])
                        .args(["-pass", pass.to_string().as_str()]);
                }
            }
            Codec::H265 => {
                let mut params = vec![
                    format!("vbv-maxrate={}", max_rate),
                    format!("vbv-bufsize={}", buf_size),
                    format!("keyint={}", keyframe_distance * 2),
                    format!("keyint_min={}", keyframe_distance),
                ];
                if two_pass {
                    params.push(format!("stats={}", pass_log));
                    params.push(format!("pass={}", pass));
                }
                cmd = cmd
                    .arg("-force_key_frames")
                    .arg(force_key_frames)
                    .arg("-x265-params")
                    .arg(params.join(":"))
                    .args(["-preset", preset, "-profile:v", "main"]);
            }
            Codec::Vp9 => {
                let speed = if pass == 1 { "4" } else { "2" };
                cmd = cmd
                    .arg("-g")
                    .arg(keyframe_distance.to_string())
                    .arg("-keyint_min")
                    .arg(keyframe_distance.to_string())
                    .arg("-maxrate")
                    .arg(format!("{}k", max_rate))
                    .arg("-bufsize")
                    .arg(format!("{}k", buf_size))
                    .args(["-speed", speed]);
                if two_pass {
                    cmd = cmd
                        .args(["-passlogfile", pass_log.as_str()])
                        .args(["-pass", pass.to_string().as_str()]);
                }
            }
        }

        cmd = cmd.args(["-strict", "-2"]);

        if pass == 1 {
            cmd.args(["-an", "-f", "null", "/dev/null"])
        } else {
            let is_mp4 = paths
                .output
                .extension()
                .map(|ext| ext == "mp4")
                .unwrap_or(false);
            if is_mp4 && paths.chunk {
                cmd = cmd.args(["-movflags", "+faststart"]);
            }
            cmd.path_arg(&paths.output)
        }
    }

    /// Animated preview: 25 s from the 3 s mark at one frame per second
    pub fn preview(&self, profile_id: ProfileId, input: &Path, output: &Path) -> EncodePlan {
        let cmd = Invocation::new(&self.ffmpeg)
            .args(["-y", "-ss", "3", "-i"])
            .path_arg(input)
            .args([
                "-hide_banner",
                "-vf",
                "scale=344:-1:flags=lanczos,fps=1",
                "-t",
                "25",
                "-f",
                "gif",
            ])
            .path_arg(output);

        EncodePlan {
            profile_id,
            mode: EncodingMode::Preview,
            passes: vec![cmd],
            output: output.to_path_buf(),
        }
    }
}
