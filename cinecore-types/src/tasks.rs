//! Task envelopes and arguments carried by the task queue
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


use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Result, TypesError};
use crate::media::{MediaId, ProfileId};

/// Priority used for allow-listed minimum resolutions
pub const PRIORITY_HIGH: u8 = 0;
/// Priority used for everything else
pub const PRIORITY_NORMAL: u8 = 9;

/// Worker lanes, each consumed with its own concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Short,
    Long,
    Transcription,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Short, Lane::Long, Lane::Transcription];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Short => "short",
            Lane::Long => "long",
            Lane::Transcription => "transcription",
        }
    }

    pub fn parse(value: &str) -> Option<Lane> {
        match value.trim() {
            "short" => Some(Lane::Short),
            "long" => Some(Lane::Long),
            "transcription" => Some(Lane::Transcription),
            _ => None,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named tasks understood by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    MediaInit,
    ChunkizeMedia,
    EncodeMedia,
    ProduceSprite,
    CreateHls,
    WhisperTranscribe,
    CheckRunningStates,
    CheckPendingStates,
    CheckMissingProfiles,
    CheckMediaStates,
}

impl TaskName {
    /// Lane a task is routed to
    pub fn lane(&self) -> Lane {
        match self {
            TaskName::EncodeMedia | TaskName::ProduceSprite | TaskName::CreateHls => Lane::Long,
            TaskName::WhisperTranscribe => Lane::Transcription,
            _ => Lane::Short,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::MediaInit => "media_init",
            TaskName::ChunkizeMedia => "chunkize_media",
            TaskName::EncodeMedia => "encode_media",
            TaskName::ProduceSprite => "produce_sprite",
            TaskName::CreateHls => "create_hls",
            TaskName::WhisperTranscribe => "whisper_transcribe",
            TaskName::CheckRunningStates => "check_running_states",
            TaskName::CheckPendingStates => "check_pending_states",
            TaskName::CheckMissingProfiles => "check_missing_profiles",
            TaskName::CheckMediaStates => "check_media_states",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (media, profile) correlation of a queued encode
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaProfilePair {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
}

impl MediaProfilePair {
    pub fn new(media_id: MediaId, profile_id: ProfileId) -> Self {
        Self {
            media_id,
            profile_id,
        }
    }
}

/// A task as it travels through the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub name: TaskName,
    pub lane: Lane,
    pub priority: u8,
    pub args: serde_json::Value,
    /// Delivery attempts already used by retries
    pub retries: u32,
    /// Earliest time the task may run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<MediaProfilePair>,
}

impl TaskEnvelope {
    pub fn new(name: TaskName, args: impl Serialize) -> Result<Self> {
        Ok(Self {
            task_id: Uuid::new_v4().to_string(),
            name,
            lane: name.lane(),
            priority: PRIORITY_NORMAL,
            args: serde_json::to_value(args)?,
            retries: 0,
            eta: None,
            enqueued_at: Utc::now(),
            correlation: None,
        })
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_countdown(mut self, seconds: u64) -> Self {
        if seconds > 0 {
            self.eta = Some(Utc::now() + Duration::seconds(seconds as i64));
        }
        self
    }

    pub fn with_correlation(mut self, media_id: MediaId, profile_id: ProfileId) -> Self {
        self.correlation = Some(MediaProfilePair::new(media_id, profile_id));
        self
    }

    pub fn args_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| TypesError::InvalidPayload(format!("{}: {}", self.name, e)))
    }

    /// Same task re-enqueued for another attempt
    pub fn retry(&self, countdown_secs: u64) -> Self {
        let mut next = self.clone();
        next.retries += 1;
        next.enqueued_at = Utc::now();
        next.eta = None;
        next.with_countdown(countdown_secs)
    }

    /// Seconds until the task is due, zero when already due
    pub fn delay_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        match self.eta {
            Some(eta) if eta > now => (eta - now).to_std().unwrap_or_default(),
            _ => std::time::Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeMediaArgs {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub encoding_id: Uuid,
    #[serde(default)]
    pub chunk_path: Option<PathBuf>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkizeMediaArgs {
    pub media_id: MediaId,
    pub profile_ids: Vec<ProfileId>,
    #[serde(default)]
    pub force: bool,
}

/// Arguments of tasks that only need the media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTaskArgs {
    pub media_id: MediaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeArgs {
    pub media_id: MediaId,
    #[serde(default)]
    pub translate: bool,
}

/// Broadcast asking every worker to stop a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub task_id: String,
    /// Working file of the encode, used to find the process by command line
    #[serde(default)]
    pub temp_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lanes() {
        assert_eq!(TaskName::EncodeMedia.lane(), Lane::Long);
        assert_eq!(TaskName::ChunkizeMedia.lane(), Lane::Short);
        assert_eq!(TaskName::CheckMediaStates.lane(), Lane::Short);
        assert_eq!(TaskName::WhisperTranscribe.lane(), Lane::Transcription);
        assert_eq!(Lane::parse(" long "), Some(Lane::Long));
        assert_eq!(Lane::parse("gpu"), None);
    }

    #[test]
    fn test_envelope_args_roundtrip() {
        let args = TranscribeArgs {
            media_id: MediaId::from("m1"),
            translate: true,
        };
        let task = TaskEnvelope::new(TaskName::WhisperTranscribe, &args).unwrap();
        assert_eq!(task.lane, Lane::Transcription);
        assert_eq!(task.args_as::<TranscribeArgs>().unwrap(), args);
        assert!(task.args_as::<EncodeMediaArgs>().is_err());
    }

    #[test]
    fn test_retry_keeps_task_id() {
        let task = TaskEnvelope::new(
            TaskName::EncodeMedia,
            MediaTaskArgs {
                media_id: MediaId::from("m1"),
            },
        )
        .unwrap()
        .with_priority(PRIORITY_HIGH)
        .with_correlation(MediaId::from("m1"), 4);

        let retry = task.retry(5);
        assert_eq!(retry.task_id, task.task_id);
        assert_eq!(retry.retries, 1);
        assert_eq!(retry.priority, PRIORITY_HIGH);
        assert!(retry.delay_remaining(Utc::now()) > std::time::Duration::ZERO);
        assert_eq!(task.delay_remaining(Utc::now()), std::time::Duration::ZERO);
    }
}
