//! Configuration management for the cinecore encoding pipeline
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


use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Executable not found: {0}")]
    MissingExecutable(PathBuf),

    #[error("File is not executable: {0}")]
    NotExecutable(PathBuf),
}

/// Message bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    /// Key/value bucket holding the live task registry
    pub registry_bucket: String,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "CINECORE_TASKS".to_string(),
            subject_prefix: "cinecore".to_string(),
            registry_bucket: "cinecore-task-registry".to_string(),
        }
    }
}

/// Job record database. Without a URL the in-memory store is used.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// External executables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mp4hls: PathBuf,
    pub whisper_command: Option<PathBuf>,
    pub whisper_model: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mp4hls: PathBuf::from("mp4hls"),
            whisper_command: None,
            whisper_model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub media_root: PathBuf,
    pub hls_root: PathBuf,
    pub temp_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/var/lib/cinecore/media"),
            hls_root: PathBuf::from("/var/lib/cinecore/hls"),
            temp_dir: env::temp_dir(),
        }
    }
}

/// Encoding behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Split sources longer than this many seconds into chunks
    pub chunk_threshold_secs: u64,
    pub chunk_duration_secs: u64,
    pub chunked_encoding: bool,
    /// Sources longer than this are encoded single-pass CRF
    pub crf_threshold_secs: u64,
    /// Heights encoded even when above the source height
    pub minimum_resolutions: Vec<u32>,
    pub progress_save_interval: u32,
    pub soft_time_limit_secs: u64,
    pub termination_grace_secs: u64,
    pub max_retries: u32,
    pub retry_countdown_secs: u64,
    /// Output fragments marking a failure as permanent
    pub permanent_errors: Vec<String>,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_secs: 300,
            chunk_duration_secs: 240,
            chunked_encoding: true,
            crf_threshold_secs: 2,
            minimum_resolutions: vec![240, 360],
            progress_save_interval: 20,
            soft_time_limit_secs: 7200,
            termination_grace_secs: 5,
            max_retries: 1,
            retry_countdown_secs: 5,
            permanent_errors: default_permanent_errors(),
        }
    }
}

/// Failure signatures that are never retried
pub fn default_permanent_errors() -> Vec<String> {
    vec![
        "Output file is empty, nothing was encoded".to_string(),
        "Invalid data found when processing input".to_string(),
        "Unable to find a suitable output format for".to_string(),
    ]
}

/// Reconciliation sweeps. An interval of zero disables the sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub running_stale_secs: u64,
    /// Videos touched more recently than this are skipped by the
    /// missing-profile sweep
    pub missing_profiles_settle_secs: u64,
    pub running_interval_secs: u64,
    pub pending_interval_secs: u64,
    pub missing_profiles_interval_secs: u64,
    pub media_states_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            running_stale_secs: 7200,
            missing_profiles_settle_secs: 600,
            running_interval_secs: 600,
            pending_interval_secs: 7200,
            missing_profiles_interval_secs: 3600,
            media_states_interval_secs: 36000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub sprite_interval_secs: u32,
    pub hls_segment_duration: u32,
    pub produce_sprites: bool,
    pub produce_hls: bool,
    pub produce_poster: bool,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            sprite_interval_secs: 10,
            hls_segment_duration: 4,
            produce_sprites: true,
            produce_hls: true,
            produce_poster: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    /// Lanes consumed by this process
    pub lanes: Vec<String>,
    pub short_concurrency: usize,
    pub long_concurrency: usize,
    pub transcription_concurrency: usize,
    pub http_port: u16,
    /// Run the periodic sweep scheduler in this process
    pub scheduler: bool,
    /// Acknowledgement deadline for delivered tasks
    pub ack_wait_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "cinecore-worker".to_string(),
            lanes: vec![
                "short".to_string(),
                "long".to_string(),
                "transcription".to_string(),
            ],
            short_concurrency: 4,
            long_concurrency: 1,
            transcription_concurrency: 1,
            http_port: 8080,
            scheduler: true,
            ack_wait_secs: 10800,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub message_bus: MessageBusConfig,
    pub database: DatabaseConfig,
    pub tools: ToolsConfig,
    pub paths: PathsConfig,
    pub encoding: EncodingConfig,
    pub reconcile: ReconcileConfig,
    pub artifacts: ArtifactsConfig,
    pub worker: WorkerConfig,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    ///
    /// Nested keys use the `CINECORE_` prefix with `__` between section
    /// and field, e.g. `CINECORE_ENCODING__CHUNK_DURATION_SECS=120`. List
    /// values are comma separated. The unprefixed `MESSAGE_BUS_URL`,
    /// `DATABASE_URL`, `LOG_LEVEL`, `LOG_FORMAT` and `HEALTH_CHECK_PORT`
    /// variables are honoured as well.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(Self::environment())
            .build()?;
        let mut config: PipelineConfig = settings.try_deserialize()?;
        config.apply_plain_overrides()?;
        Ok(config)
    }

    /// Layer a TOML/YAML/JSON file under the environment
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(Self::environment())
            .build()?;
        let mut config: PipelineConfig = settings.try_deserialize()?;
        config.apply_plain_overrides()?;
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("CINECORE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("encoding.minimum_resolutions")
            .with_list_parse_key("encoding.permanent_errors")
            .with_list_parse_key("worker.lanes")
    }

    fn apply_plain_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("MESSAGE_BUS_URL") {
            self.message_bus.url = url;
        }
        if let Ok(stream) = env::var("MESSAGE_BUS_STREAM_NAME") {
            self.message_bus.stream_name = stream;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = Some(url);
            }
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            self.log_format = Some(format);
        }
        if let Ok(port) = env::var("HEALTH_CHECK_PORT") {
            self.worker.http_port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "HEALTH_CHECK_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if self.log_level.is_none() {
            self.log_level = Some("info".to_string());
        }
        Ok(())
    }

    /// Get message bus URL
    pub fn message_bus_url(&self) -> &str {
        &self.message_bus.url
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// True when logs should be emitted as JSON
    pub fn json_logs(&self) -> bool {
        matches!(self.log_format.as_deref(), Some("json"))
    }

    /// Check that the always-required executables can be run
    pub fn validate_tools(&self) -> Result<(), ConfigError> {
        require_executable(&self.tools.ffmpeg)?;
        require_executable(&self.tools.ffprobe)?;
        Ok(())
    }

    /// Whisper binary and model, both required for transcription
    pub fn whisper(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
        let command = self
            .tools
            .whisper_command
            .clone()
            .ok_or_else(|| ConfigError::Missing("whisper command".to_string()))?;
        let model = self
            .tools
            .whisper_model
            .clone()
            .ok_or_else(|| ConfigError::Missing("whisper model".to_string()))?;
        let command = require_executable(&command)?;
        if !model.is_file() {
            return Err(ConfigError::Missing(format!(
                "whisper model {}",
                model.display()
            )));
        }
        Ok((command, model))
    }
}

/// Resolve an executable, searching `PATH` for bare names
pub fn require_executable(path: &Path) -> Result<PathBuf, ConfigError> {
    let candidates: Vec<PathBuf> = if path.components().count() > 1 || path.is_absolute() {
        vec![path.to_path_buf()]
    } else {
        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).map(|dir| dir.join(path)).collect())
            .unwrap_or_default()
    };

    let mut found_non_executable = None;
    for candidate in candidates {
        if !candidate.is_file() {
            continue;
        }
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        found_non_executable = Some(candidate);
    }

    match found_non_executable {
        Some(candidate) => Err(ConfigError::NotExecutable(candidate)),
        None => Err(ConfigError::MissingExecutable(path.to_path_buf())),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
