//! Chunk planning for long sources
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


use crate::command::{CommandBuilder, Invocation};
use crate::parser::SegmentParser;
use crate::probe::file_checksum;
use crate::runner::ProcessRunner;
use cinecore_config::PipelineConfig;
use cinecore_types::{ChunkDescriptor, PRIORITY_HIGH, PRIORITY_NORMAL};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Chunks recovered from one segmentation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkManifest {
    /// Chunk files in segment order
    pub chunks: Vec<PathBuf>,
    /// Chunk path to hex checksum
    pub checksums: BTreeMap<String, String>,
}

impl ChunkManifest {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Descriptors for every chunk, sharing one manifest
    pub fn descriptors(&self) -> Vec<ChunkDescriptor> {
        self.chunks
            .iter()
            .map(|path| {
                let key = path.to_string_lossy().into_owned();
                ChunkDescriptor {
                    path: path.clone(),
                    checksum: self.checksums.get(&key).cloned().unwrap_or_default(),
                    chunks_info: self.checksums.clone(),
                }
            })
            .collect()
    }
}

/// Leading segment index of a chunk file name (`07_...` -> 7)
pub fn segment_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Manifest paths ordered by segment index, then by name
pub fn ordered_chunks(chunks_info: &BTreeMap<String, String>) -> Vec<PathBuf> {
    let mut chunks: Vec<PathBuf> = chunks_info.keys().map(PathBuf::from).collect();
    chunks.sort_by(|a, b| {
        segment_index(a)
            .cmp(&segment_index(b))
            .then_with(|| a.cmp(b))
    });
    chunks
}

/// Queue priority of a chunk encode: minimum resolutions go first
pub fn chunk_priority(builder: &CommandBuilder, resolution: u32) -> u8 {
    if builder.is_minimum_resolution(resolution) {
        PRIORITY_HIGH
    } else {
        PRIORITY_NORMAL
    }
}

fn random_prefix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Decides on and performs stream-copy segmentation
#[derive(Clone)]
pub struct ChunkPlanner {
    ffmpeg: PathBuf,
    enabled: bool,
    threshold_secs: f64,
    chunk_duration_secs: u64,
    parser: Arc<dyn SegmentParser>,
}

impl ChunkPlanner {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        enabled: bool,
        threshold_secs: f64,
        chunk_duration_secs: u64,
        parser: Arc<dyn SegmentParser>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            enabled,
            threshold_secs,
            chunk_duration_secs,
            parser,
        }
    }

    pub fn from_config(config: &PipelineConfig, parser: Arc<dyn SegmentParser>) -> Self {
        Self::new(
            config.tools.ffmpeg.clone(),
            config.encoding.chunked_encoding,
            config.encoding.chunk_threshold_secs as f64,
            config.encoding.chunk_duration_secs,
            parser,
        )
    }

    pub fn chunk_duration_secs(&self) -> u64 {
        self.chunk_duration_secs
    }

    pub fn should_chunk(&self, duration: Option<f64>) -> bool {
        self.enabled && duration.map(|d| d > self.threshold_secs).unwrap_or(false)
    }

    /// Segmentation command, run from the directory holding the source
    pub fn segment_invocation(&self, source: &Path, prefix: &str) -> Invocation {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pattern = format!("%02d_{}_{}.mkv", prefix, file_name);

        let mut invocation = Invocation::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .path_arg(source)
            .args(["-c", "copy", "-f", "segment", "-segment_time"])
            .arg(self.chunk_duration_secs.to_string())
            .arg(pattern);
        if let Some(dir) = source.parent().filter(|d| !d.as_os_str().is_empty()) {
            invocation = invocation.in_dir(dir);
        }
        invocation
    }

    /// Segment `source`. Any failure yields an empty manifest and callers
    /// fall back to whole-file encodes.
    pub async fn segment(
        &self,
        runner: &ProcessRunner,
        source: &Path,
        cancel: CancellationToken,
    ) -> ChunkManifest {
        let invocation = self.segment_invocation(source, &random_prefix());
        let dir = invocation.working_dir.clone().unwrap_or_default();

        let mut opened = Vec::new();
        let result = runner
            .run_to_end(&invocation, cancel, |token| {
                if let Some(path) = self.parser.parse(&token.line) {
                    opened.push(path);
                }
            })
            .await;

        if let Err(e) = result {
            warn!(source = %source.display(), error = %e, "Segmentation failed");
            return ChunkManifest::default();
        }

        let mut manifest = ChunkManifest::default();
        for chunk in opened {
            let path = if chunk.is_absolute() { chunk } else { dir.join(chunk) };
            match file_checksum(&path).await {
                Ok(sum) => {
                    manifest
                        .checksums
                        .insert(path.to_string_lossy().into_owned(), sum);
                    manifest.chunks.push(path);
                }
                Err(e) => {
                    warn!(chunk = %path.display(), error = %e, "Chunk unreadable, dropping segmentation");
                    return ChunkManifest::default();
                }
            }
        }

        info!(
            source = %source.display(),
            chunks = manifest.len(),
            "Segmented source into chunks"
        );
        manifest
    }
}

/// Remove chunk files listed in a manifest, ignoring ones already gone
pub async fn remove_chunks(chunks_info: &BTreeMap<String, String>) {
    for path in chunks_info.keys() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(chunk = %path, error = %e, "Failed to remove chunk");
            }
        }
    }
}
