//! In-memory job store
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


use super::{JobStore, MediaFilter, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use cinecore_types::{
    EncodeProfile, EncodingJob, EncodingStatus, JobKey, MediaId, ProfileId, SourceMedia,
    Subtitle, TranscriptionRequest,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryData {
    media: HashMap<MediaId, SourceMedia>,
    profiles: BTreeMap<ProfileId, EncodeProfile>,
    jobs: HashMap<Uuid, EncodingJob>,
    transcriptions: HashMap<(MediaId, bool), TranscriptionRequest>,
    subtitles: HashMap<Uuid, Subtitle>,
}

/// Store kept in process memory. Used by tests and single-node setups
/// without a database; every multi-record operation runs under one lock.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    data: Arc<RwLock<MemoryData>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job records, all statuses
    pub async fn job_count(&self) -> usize {
        self.data.read().await.jobs.len()
    }

    pub async fn all_jobs(&self) -> Vec<EncodingJob> {
        let mut jobs: Vec<_> = self.data.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

fn sorted(mut jobs: Vec<EncodingJob>) -> Vec<EncodingJob> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    jobs
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_media(&self, id: &MediaId) -> StoreResult<Option<SourceMedia>> {
        Ok(self.data.read().await.media.get(id).cloned())
    }

    async fn save_media(&self, media: &SourceMedia) -> StoreResult<()> {
        self.data
            .write()
            .await
            .media
            .insert(media.id.clone(), media.clone());
        Ok(())
    }

    async fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<SourceMedia>> {
        let data = self.data.read().await;
        let mut media: Vec<_> = data
            .media
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        media.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(media)
    }

    async fn list_profiles(&self, active_only: bool) -> StoreResult<Vec<EncodeProfile>> {
        Ok(self
            .data
            .read()
            .await
            .profiles
            .values()
            .filter(|p| !active_only || p.active)
            .cloned()
            .collect())
    }

    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<EncodeProfile>> {
        Ok(self.data.read().await.profiles.get(&id).cloned())
    }

    async fn save_profile(&self, profile: &EncodeProfile) -> StoreResult<()> {
        self.data
            .write()
            .await
            .profiles
            .insert(profile.id, profile.clone());
        Ok(())
    }

    async fn create_job(&self, job: &EncodingJob) -> StoreResult<()> {
        let mut data = self.data.write().await;
        if data.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        data.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<EncodingJob>> {
        Ok(self.data.read().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &EncodingJob) -> StoreResult<()> {
        let mut data = self.data.write().await;
        match data.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("encoding job {}", job.id))),
        }
    }

    async fn delete_job(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.data.write().await.jobs.remove(&id).is_some())
    }

    async fn jobs_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<EncodingJob>> {
        let data = self.data.read().await;
        Ok(sorted(
            data.jobs
                .values()
                .filter(|j| &j.media_id == media_id)
                .cloned()
                .collect(),
        ))
    }

    async fn jobs_for_key(&self, key: &JobKey) -> StoreResult<Vec<EncodingJob>> {
        let data = self.data.read().await;
        Ok(sorted(
            data.jobs
                .values()
                .filter(|j| &j.key() == key)
                .cloned()
                .collect(),
        ))
    }

    async fn jobs_with_status(&self, status: EncodingStatus) -> StoreResult<Vec<EncodingJob>> {
        let data = self.data.read().await;
        Ok(sorted(
            data.jobs
                .values()
                .filter(|j| j.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn delete_jobs_by_task(&self, task_id: &str) -> StoreResult<Vec<EncodingJob>> {
        let mut data = self.data.write().await;
        let ids: Vec<Uuid> = data
            .jobs
            .values()
            .filter(|j| j.task_id.as_deref() == Some(task_id))
            .map(|j| j.id)
            .collect();
        Ok(ids.iter().filter_map(|id| data.jobs.remove(id)).collect())
    }

    async fn replace_active(&self, job: &EncodingJob) -> StoreResult<usize> {
        let key = job.key();
        let mut data = self.data.write().await;
        let before = data.jobs.len();
        data.jobs.retain(|id, other| *id == job.id || other.key() != key);
        let removed = before - data.jobs.len();
        data.jobs.insert(job.id, job.clone());
        Ok(removed)
    }

    async fn create_transcription(&self, request: &TranscriptionRequest) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        let key = (request.media_id.clone(), request.translate);
        if data.transcriptions.contains_key(&key) {
            return Ok(false);
        }
        data.transcriptions.insert(key, request.clone());
        Ok(true)
    }

    async fn transcription_exists(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool> {
        Ok(self
            .data
            .read()
            .await
            .transcriptions
            .contains_key(&(media_id.clone(), translate)))
    }

    async fn delete_transcription(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool> {
        Ok(self
            .data
            .write()
            .await
            .transcriptions
            .remove(&(media_id.clone(), translate))
            .is_some())
    }

    async fn save_subtitle(&self, subtitle: &Subtitle) -> StoreResult<()> {
        self.data
            .write()
            .await
            .subtitles
            .insert(subtitle.id, subtitle.clone());
        Ok(())
    }

    async fn delete_subtitle(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.data.write().await.subtitles.remove(&id).is_some())
    }

    async fn subtitles_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<Subtitle>> {
        let data = self.data.read().await;
        let mut subtitles: Vec<_> = data
            .subtitles
            .values()
            .filter(|s| &s.media_id == media_id)
            .cloned()
            .collect();
        subtitles.sort_by_key(|s| s.created_at);
        Ok(subtitles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinecore_types::{ChunkDescriptor, Codec};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn media_id() -> MediaId {
        MediaId::new("m1")
    }

    #[tokio::test]
    async fn test_update_after_delete_is_not_found() {
        let store = MemoryJobStore::new();
        let job = EncodingJob::pending(media_id(), 1, None);
        store.create_job(&job).await.unwrap();
        assert!(store.delete_job(job.id).await.unwrap());

        let err = store.update_job(&job).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replace_active_keeps_one_per_key() {
        let store = MemoryJobStore::new();
        let first = EncodingJob::pending(media_id(), 1, None);
        let second = EncodingJob::pending(media_id(), 1, None);
        let other_profile = EncodingJob::pending(media_id(), 2, None);
        for job in [&first, &second, &other_profile] {
            store.create_job(job).await.unwrap();
        }

        let mut running = second.clone();
        running.start("task-2", "w1").unwrap();
        assert_eq!(store.replace_active(&running).await.unwrap(), 1);

        let jobs = store.jobs_for_key(&first.key()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(jobs[0].status, EncodingStatus::Running);
        assert_eq!(store.job_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_replacements_leave_one_record() {
        let store = MemoryJobStore::new();
        let a = EncodingJob::pending(media_id(), 1, None);
        let b = EncodingJob::pending(media_id(), 1, None);
        store.create_job(&a).await.unwrap();
        store.create_job(&b).await.unwrap();

        let (ra, rb) = tokio::join!(store.replace_active(&a), store.replace_active(&b));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(store.jobs_for_key(&a.key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_keys_are_distinct() {
        let store = MemoryJobStore::new();
        let chunk = |path: &str| ChunkDescriptor {
            path: PathBuf::from(path),
            checksum: "x".into(),
            chunks_info: BTreeMap::new(),
        };
        let whole = EncodingJob::pending(media_id(), 1, None);
        let c0 = EncodingJob::pending(media_id(), 1, Some(chunk("/m/00_a.mkv")));
        let c1 = EncodingJob::pending(media_id(), 1, Some(chunk("/m/01_a.mkv")));
        for job in [&whole, &c0, &c1] {
            store.create_job(job).await.unwrap();
        }
        assert_eq!(store.replace_active(&c0).await.unwrap(), 0);
        assert_eq!(store.jobs_for_media(&media_id()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_by_task() {
        let store = MemoryJobStore::new();
        let mut job = EncodingJob::pending(media_id(), 1, None);
        job.task_id = Some("t1".into());
        store.create_job(&job).await.unwrap();

        let removed = store.delete_jobs_by_task("t1").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transcription_request_once() {
        let store = MemoryJobStore::new();
        let first = TranscriptionRequest::new(media_id(), false);
        let second = TranscriptionRequest::new(media_id(), false);
        assert!(store.create_transcription(&first).await.unwrap());
        assert!(!store.create_transcription(&second).await.unwrap());
        assert!(store.create_transcription(&TranscriptionRequest::new(media_id(), true)).await.unwrap());

        assert!(store.delete_transcription(&media_id(), false).await.unwrap());
        assert!(!store.transcription_exists(&media_id(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_profiles_active_filter() {
        let store = MemoryJobStore::new();
        let mut inactive = EncodeProfile::new(2, "h265-720", Codec::H265, 720);
        inactive.active = false;
        store.save_profile(&EncodeProfile::new(1, "h264-240", Codec::H264, 240)).await.unwrap();
        store.save_profile(&inactive).await.unwrap();

        assert_eq!(store.list_profiles(true).await.unwrap().len(), 1);
        assert_eq!(store.list_profiles(false).await.unwrap().len(), 2);
    }
}
