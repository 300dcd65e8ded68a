//! Encoding job records and their lifecycle
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
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, TypesError};
use crate::media::{MediaId, ProfileId};

/// Characters of diagnostic output kept on a job record
pub const LOG_TAIL_CHARS: usize = 1000;

/// Retries granted to a freshly queued job
pub const DEFAULT_RETRIES: u32 = 1;

/// Lifecycle status of an encoding job, also used for the media aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingStatus {
    Pending,
    Running,
    Success,
    Fail,
}

impl EncodingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingStatus::Pending => "pending",
            EncodingStatus::Running => "running",
            EncodingStatus::Success => "success",
            EncodingStatus::Fail => "fail",
        }
    }

    /// Pending and running jobs still hold their key
    pub fn is_active(&self) -> bool {
        matches!(self, EncodingStatus::Pending | EncodingStatus::Running)
    }

    /// Legal edges of the job state machine. `fail -> running` is the
    /// retry edge and is further bounded by retries remaining.
    pub fn can_transition_to(&self, next: EncodingStatus) -> bool {
        use EncodingStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Success) | (Running, Fail) | (Fail, Running)
        )
    }
}

impl fmt::Display for EncodingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EncodingStatus::Pending),
            "running" => Ok(EncodingStatus::Running),
            "success" => Ok(EncodingStatus::Success),
            "fail" => Ok(EncodingStatus::Fail),
            other => Err(TypesError::InvalidStatus(other.to_string())),
        }
    }
}

/// One chunk of a segmented source plus the manifest shared by its siblings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub path: PathBuf,
    /// Hex SHA-256 of the chunk file
    pub checksum: String,
    /// Every sibling chunk path mapped to its checksum. Keys sort in
    /// segment order because the segmenter prefixes a zero-padded index.
    pub chunks_info: BTreeMap<String, String>,
}

impl ChunkDescriptor {
    pub fn path_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Identity of an encoding slot: at most one active job per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub chunk: Option<String>,
}

impl JobKey {
    pub fn new(media_id: MediaId, profile_id: ProfileId, chunk: Option<String>) -> Self {
        Self {
            media_id,
            profile_id,
            chunk,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chunk {
            Some(chunk) => write!(f, "{}/{}/{}", self.media_id, self.profile_id, chunk),
            None => write!(f, "{}/{}", self.media_id, self.profile_id),
        }
    }
}

/// A single encoding attempt record for (media, profile, chunk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingJob {
    pub id: Uuid,
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub chunk: Option<ChunkDescriptor>,
    pub status: EncodingStatus,
    /// Percentage in [0, 100]
    pub progress: f32,
    pub task_id: Option<String>,
    /// Attempts already used
    pub retries: u32,
    pub retries_remaining: u32,
    pub worker: Option<String>,
    /// Output artifact, present only on success
    pub media_file: Option<PathBuf>,
    /// Working file the encoder writes to while running
    pub temp_file: Option<PathBuf>,
    pub commands: Vec<String>,
    pub logs: String,
    /// Seconds spent in the runner
    pub total_run_time: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EncodingJob {
    /// Create a pending job for a freshly queued profile
    pub fn pending(media_id: MediaId, profile_id: ProfileId, chunk: Option<ChunkDescriptor>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            media_id,
            profile_id,
            chunk,
            status: EncodingStatus::Pending,
            progress: 0.0,
            task_id: None,
            retries: 0,
            retries_remaining: DEFAULT_RETRIES,
            worker: None,
            media_file: None,
            temp_file: None,
            commands: Vec::new(),
            logs: String::new(),
            total_run_time: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(
            self.media_id.clone(),
            self.profile_id,
            self.chunk.as_ref().map(|c| c.path_key()),
        )
    }

    pub fn is_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    /// Terminal failure: failed with nothing left to retry
    pub fn is_terminal_failure(&self) -> bool {
        self.status == EncodingStatus::Fail && self.retries_remaining == 0
    }

    fn transition(&mut self, next: EncodingStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TypesError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to running for a worker. Starting from `fail` consumes a retry.
    pub fn start(&mut self, task_id: impl Into<String>, worker: impl Into<String>) -> Result<()> {
        if self.status == EncodingStatus::Fail && self.retries_remaining == 0 {
            return Err(TypesError::InvalidTransition {
                from: "fail (no retries remaining)".to_string(),
                to: EncodingStatus::Running.to_string(),
            });
        }
        let retrying = self.status == EncodingStatus::Fail;
        self.transition(EncodingStatus::Running)?;
        if retrying {
            self.retries_remaining -= 1;
            self.retries += 1;
        }
        self.task_id = Some(task_id.into());
        self.worker = Some(worker.into());
        self.progress = 0.0;
        self.media_file = None;
        Ok(())
    }

    /// Record a progress percentage. Returns true if the stored value
    /// changed; values below the current one are ignored.
    pub fn record_progress(&mut self, percent: f32) -> bool {
        if self.status != EncodingStatus::Running || !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.updated_at = Utc::now();
        true
    }

    pub fn succeed(&mut self, media_file: impl Into<PathBuf>) -> Result<()> {
        self.transition(EncodingStatus::Success)?;
        self.media_file = Some(media_file.into());
        self.progress = 100.0;
        Ok(())
    }

    /// Fail the running attempt. Permanent failures forfeit any retry.
    pub fn fail(&mut self, logs: &str, permanent: bool) -> Result<()> {
        self.transition(EncodingStatus::Fail)?;
        self.set_logs(logs);
        if permanent {
            self.retries_remaining = 0;
        }
        Ok(())
    }

    pub fn set_logs(&mut self, logs: &str) {
        self.logs = tail_chars(logs, LOG_TAIL_CHARS).to_string();
    }
}

/// Last `max` characters of `text`, split on a char boundary
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// A queued or in-flight speech transcription for (media, translate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub id: Uuid,
    pub media_id: MediaId,
    pub translate: bool,
    pub created_at: DateTime<Utc>,
}

impl TranscriptionRequest {
    pub fn new(media_id: MediaId, translate: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            media_id,
            translate,
            created_at: Utc::now(),
        }
    }
}

/// Subtitle track produced by the transcript generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtitle {
    pub id: Uuid,
    pub media_id: MediaId,
    pub language_code: String,
    pub file: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Subtitle {
    pub fn new(media_id: MediaId, language_code: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            media_id,
            language_code: language_code.into(),
            file: file.into(),
            created_at: Utc::now(),
        }
    }
}
