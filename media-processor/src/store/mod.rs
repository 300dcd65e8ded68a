//! Job record persistence
//!
//! The store is the only shared mutable state of the pipeline. Workers
//! coordinate through it and through the task queue, nothing else.
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


mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use crate::error::StoreError;
use async_trait::async_trait;
use cinecore_types::{
    EncodeProfile, EncodingJob, EncodingStatus, JobKey, MediaId, MediaType, ProfileId,
    SourceMedia, Subtitle, TranscriptionRequest,
};
use uuid::Uuid;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Selection of media records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaFilter {
    pub media_type: Option<MediaType>,
    /// Skip media whose aggregate status equals this
    pub exclude_status: Option<EncodingStatus>,
}

impl MediaFilter {
    pub fn videos() -> Self {
        Self {
            media_type: Some(MediaType::Video),
            exclude_status: None,
        }
    }

    pub fn unsettled() -> Self {
        Self {
            media_type: None,
            exclude_status: Some(EncodingStatus::Success),
        }
    }

    pub fn matches(&self, media: &SourceMedia) -> bool {
        self.media_type.map_or(true, |t| media.media_type == t)
            && self.exclude_status.map_or(true, |s| media.encoding_status != s)
    }
}

/// Storage of media, profiles, encoding jobs and transcription records
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_media(&self, id: &MediaId) -> StoreResult<Option<SourceMedia>>;

    async fn save_media(&self, media: &SourceMedia) -> StoreResult<()>;

    async fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<SourceMedia>>;

    async fn list_profiles(&self, active_only: bool) -> StoreResult<Vec<EncodeProfile>>;

    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<EncodeProfile>>;

    async fn save_profile(&self, profile: &EncodeProfile) -> StoreResult<()>;

    async fn create_job(&self, job: &EncodingJob) -> StoreResult<()>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<EncodingJob>>;

    /// Overwrite an existing job. Fails with `NotFound` when the record was
    /// deleted meanwhile, which is how a running task learns it was revoked
    /// or superseded.
    async fn update_job(&self, job: &EncodingJob) -> StoreResult<()>;

    async fn delete_job(&self, id: Uuid) -> StoreResult<bool>;

    async fn jobs_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<EncodingJob>>;

    async fn jobs_for_key(&self, key: &JobKey) -> StoreResult<Vec<EncodingJob>>;

    async fn jobs_with_status(&self, status: EncodingStatus) -> StoreResult<Vec<EncodingJob>>;

    /// Delete every job tied to a task id, returning the removed records
    async fn delete_jobs_by_task(&self, task_id: &str) -> StoreResult<Vec<EncodingJob>>;

    /// Make `job` the only record for its key: every other record with the
    /// same key is deleted and `job` is inserted or overwritten in one step.
    /// Returns how many records were removed.
    async fn replace_active(&self, job: &EncodingJob) -> StoreResult<usize>;

    /// Create a request unless one exists for (media, translate). Returns
    /// false when a request was already present.
    async fn create_transcription(&self, request: &TranscriptionRequest) -> StoreResult<bool>;

    async fn transcription_exists(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool>;

    async fn delete_transcription(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool>;

    async fn save_subtitle(&self, subtitle: &Subtitle) -> StoreResult<()>;

    async fn delete_subtitle(&self, id: Uuid) -> StoreResult<bool>;

    async fn subtitles_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<Subtitle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_filter() {
        let mut media = SourceMedia::new(MediaId::new("abc"), "/m/abc/in.mp4");
        media.media_type = MediaType::Video;
        media.encoding_status = EncodingStatus::Success;

        assert!(MediaFilter::videos().matches(&media));
        assert!(!MediaFilter::unsettled().matches(&media));

        media.media_type = MediaType::Audio;
        assert!(!MediaFilter::videos().matches(&media));
        assert!(MediaFilter::default().matches(&media));
    }
}
