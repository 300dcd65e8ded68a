//! Media and encode profile records
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TypesError;
use crate::jobs::EncodingStatus;

/// Opaque friendly token identifying a media item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(pub String);

impl MediaId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Encode profile identifier
pub type ProfileId = i32;

/// Kind of uploaded media, decided while probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
    Image,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Image => "image",
            MediaType::Other => "other",
        }
    }
}

impl FromStr for MediaType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "image" => Ok(MediaType::Image),
            _ => Ok(MediaType::Other),
        }
    }
}

/// Technical metadata discovered by probing the source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// Frames per second, already evaluated from `num/den` form
    pub frame_rate: f64,
    pub has_video: bool,
    pub has_audio: bool,
    /// Video bitrate in kbit/s
    pub video_bitrate: f64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Audio bitrate in kbit/s
    pub audio_bitrate: Option<f64>,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub file_size: u64,
    pub checksum: Option<String>,
}

/// An uploaded media item as seen by the pipeline.
///
/// Owned by the upload subsystem. The pipeline writes the probed fields
/// during initialization, the artifact references it produces and the
/// derived `encoding_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMedia {
    pub id: MediaId,
    pub uid: Uuid,
    pub file_path: PathBuf,
    pub media_type: MediaType,
    pub duration: Option<f64>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub media_info: Option<MediaInfo>,
    pub encoding_status: EncodingStatus,
    pub hls_file: Option<PathBuf>,
    pub sprites: Option<PathBuf>,
    pub poster: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceMedia {
    /// Create a freshly uploaded, not yet probed media record
    pub fn new(id: MediaId, file_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id,
            uid: Uuid::new_v4(),
            file_path: file_path.into(),
            media_type: MediaType::Other,
            duration: None,
            video_width: None,
            video_height: None,
            media_info: None,
            encoding_status: EncodingStatus::Pending,
            hls_file: None,
            sprites: None,
            poster: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Write the fields discovered while probing
    pub fn apply_probe(&mut self, media_type: MediaType, info: MediaInfo) {
        self.media_type = media_type;
        if info.has_video || info.duration > 0.0 {
            self.duration = Some(info.duration);
        }
        if info.has_video {
            self.video_width = Some(info.width);
            self.video_height = Some(info.height);
        }
        self.media_info = Some(info);
        self.updated_at = Utc::now();
    }

    /// Per-media artifact directory under the media root
    pub fn media_dir(&self, media_root: &Path) -> PathBuf {
        media_root.join(self.id.as_str())
    }

    /// File name of the original without its extension
    pub fn file_stem(&self) -> String {
        self.file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Target video codec family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    H265,
    Vp9,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Vp9 => "vp9",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            "vp9" => Ok(Codec::Vp9),
            other => Err(TypesError::InvalidCodec(other.to_string())),
        }
    }
}

/// Output container of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Mp4,
    Webm,
    Gif,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
            Container::Gif => "gif",
        }
    }
}

impl FromStr for Container {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(Container::Mp4),
            "webm" => Ok(Container::Webm),
            "gif" => Ok(Container::Gif),
            other => Err(TypesError::InvalidContainer(other.to_string())),
        }
    }
}

/// Named encoding target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub id: ProfileId,
    pub name: String,
    pub extension: Container,
    /// Target height in pixels
    pub resolution: u32,
    pub codec: Option<Codec>,
    pub active: bool,
}

impl EncodeProfile {
    pub fn new(id: ProfileId, name: impl Into<String>, codec: Codec, resolution: u32) -> Self {
        let extension = match codec {
            Codec::Vp9 => Container::Webm,
            Codec::H264 | Codec::H265 => Container::Mp4,
        };
        Self {
            id,
            name: name.into(),
            extension,
            resolution,
            codec: Some(codec),
            active: true,
        }
    }

    /// Animated preview profile
    pub fn preview(id: ProfileId) -> Self {
        Self {
            id,
            name: "preview".to_string(),
            extension: Container::Gif,
            resolution: 0,
            codec: None,
            active: true,
        }
    }

    pub fn is_preview(&self) -> bool {
        self.extension == Container::Gif
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_aliases() {
        assert_eq!("hevc".parse::<Codec>().unwrap(), Codec::H265);
        assert_eq!("H264".parse::<Codec>().unwrap(), Codec::H264);
        assert!("av1".parse::<Codec>().is_err());
    }

    #[test]
    fn test_profile_container_follows_codec() {
        assert_eq!(EncodeProfile::new(1, "vp9-720", Codec::Vp9, 720).extension, Container::Webm);
        assert_eq!(EncodeProfile::new(2, "h264-720", Codec::H264, 720).extension, Container::Mp4);
        assert!(EncodeProfile::preview(3).is_preview());
    }

    #[test]
    fn test_apply_probe_sets_dimensions_for_video() {
        let mut media = SourceMedia::new(MediaId::from("abc"), "/media/abc/movie.mp4");
        let info = MediaInfo {
            duration: 12.5,
            width: 640,
            height: 360,
            has_video: true,
            ..Default::default()
        };
        media.apply_probe(MediaType::Video, info);

        assert_eq!(media.duration, Some(12.5));
        assert_eq!(media.video_height, Some(360));
        assert_eq!(media.file_stem(), "movie");
    }
}
