//! Error types for the encoding pipeline
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


use cinecore_config::ConfigError;
use cinecore_types::{MediaId, ProfileId, TypesError};
use std::fmt;
use std::path::PathBuf;
use task_queue_client::QueueError;
use thiserror::Error;

/// Why a running process was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The task was revoked or its record superseded
    Revoked,
    /// The soft wall-clock limit elapsed
    TimedOut,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::Revoked => f.write_str("revoked"),
            KillReason::TimedOut => f.write_str("soft time limit exceeded"),
        }
    }
}

/// Errors raised while running an external tool
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoding failed (exit code {code:?}): {tail}")]
    EncodeFailure { code: Option<i32>, tail: String },

    #[error("No output from FFmpeg.")]
    NoOutput,

    #[error("Process killed ({reason}): {tail}")]
    Killed { reason: KillReason, tail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl RunnerError {
    /// Diagnostic output captured before the failure
    pub fn tail(&self) -> &str {
        match self {
            RunnerError::EncodeFailure { tail, .. } | RunnerError::Killed { tail, .. } => tail,
            _ => "",
        }
    }

    /// Text stored on the job record
    pub fn log_text(&self) -> String {
        match self {
            RunnerError::EncodeFailure { tail, .. } if !tail.is_empty() => tail.clone(),
            RunnerError::Killed { reason, tail } => format!("{}\n{}", tail, reason),
            other => other.to_string(),
        }
    }
}

/// Errors raised by job record stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Invalid record: {0}")]
    Invalid(#[from] TypesError),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Top level pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Invalid data: {0}")]
    Types(#[from] TypesError),

    #[error("Probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("Media not found: {0}")]
    MediaNotFound(MediaId),

    #[error("Encode profile not found: {0}")]
    ProfileNotFound(ProfileId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_text_prefers_tail() {
        let err = RunnerError::EncodeFailure {
            code: Some(1),
            tail: "Invalid data found when processing input".to_string(),
        };
        assert_eq!(err.log_text(), "Invalid data found when processing input");

        let killed = RunnerError::Killed {
            reason: KillReason::TimedOut,
            tail: "frame=10".to_string(),
        };
        assert!(killed.log_text().contains("soft time limit exceeded"));
        assert_eq!(RunnerError::NoOutput.log_text(), "No output from FFmpeg.");
    }
}
