//! Aggregate encoding status and job bookkeeping helpers
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


use crate::command::{target_bitrate, CommandBuilder};
use cinecore_types::{EncodeProfile, EncodingJob, EncodingStatus, ProfileId, SourceMedia};
use std::collections::{BTreeMap, BTreeSet};

/// Active profiles the command builder would produce for this media
pub fn required_profiles(
    builder: &CommandBuilder,
    media: &SourceMedia,
    profiles: &[EncodeProfile],
) -> Vec<EncodeProfile> {
    let frame_rate = media
        .media_info
        .as_ref()
        .map(|info| info.frame_rate)
        .unwrap_or(25.0);

    profiles
        .iter()
        .filter(|p| p.active)
        .filter(|p| builder.should_encode(p, media.video_height))
        .filter(|p| {
            p.is_preview()
                || p.codec
                    .map(|codec| target_bitrate(codec, frame_rate, p.resolution).is_some())
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Worst unresolved state across a media's jobs.
///
/// Running beats everything. A required profile without a whole-file
/// success fails the media when all of its jobs failed terminally, or when
/// any of its chunks did since it can then never be assembled. Success
/// needs a whole-file success for every required profile.
pub fn aggregate_status(
    media: &SourceMedia,
    jobs: &[EncodingJob],
    required: &[EncodeProfile],
) -> EncodingStatus {
    if !media.is_video() {
        return EncodingStatus::Success;
    }

    if jobs.iter().any(|j| j.status == EncodingStatus::Running) {
        return EncodingStatus::Running;
    }

    let mut by_profile: BTreeMap<ProfileId, Vec<&EncodingJob>> = BTreeMap::new();
    for job in jobs {
        by_profile.entry(job.profile_id).or_default().push(job);
    }

    let succeeded: BTreeSet<ProfileId> = jobs
        .iter()
        .filter(|j| j.status == EncodingStatus::Success && !j.is_chunk())
        .map(|j| j.profile_id)
        .collect();

    let failed = required.iter().any(|profile| {
        if succeeded.contains(&profile.id) {
            return false;
        }
        match by_profile.get(&profile.id) {
            Some(jobs) => {
                jobs.iter().all(|j| j.is_terminal_failure())
                    || jobs.iter().any(|j| j.is_chunk() && j.is_terminal_failure())
            }
            None => false,
        }
    });
    if failed {
        return EncodingStatus::Fail;
    }

    if required.iter().all(|p| succeeded.contains(&p.id)) {
        return EncodingStatus::Success;
    }

    EncodingStatus::Pending
}

/// Decides which progress ticks are persisted: the first, then every
/// `every`th one after it.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    every: u32,
    ticks: u32,
}

impl ProgressThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            ticks: 0,
        }
    }

    /// Count a tick. True when this one should be saved.
    pub fn tick(&mut self) -> bool {
        let save = self.ticks % self.every == 0;
        self.ticks = self.ticks.wrapping_add(1);
        save
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinecore_types::{ChunkDescriptor, Codec, MediaId, MediaInfo, MediaType};
    use std::path::PathBuf;

    fn video(height: u32) -> SourceMedia {
        let mut media = SourceMedia::new(MediaId::new("m1"), "/m/m1/in.mp4");
        media.apply_probe(
            MediaType::Video,
            MediaInfo {
                duration: 400.0,
                height,
                width: height * 16 / 9,
                frame_rate: 25.0,
                has_video: true,
                ..MediaInfo::default()
            },
        );
        media
    }

    fn profiles() -> Vec<EncodeProfile> {
        vec![
            EncodeProfile::new(1, "h264-240", Codec::H264, 240),
            EncodeProfile::new(2, "h264-360", Codec::H264, 360),
            EncodeProfile::new(3, "h264-480", Codec::H264, 480),
            EncodeProfile::new(4, "h264-720", Codec::H264, 720),
        ]
    }

    fn job(profile: ProfileId, status: EncodingStatus, remaining: u32) -> EncodingJob {
        let mut job = EncodingJob::pending(MediaId::new("m1"), profile, None);
        job.status = status;
        job.retries_remaining = remaining;
        job
    }

    fn builder() -> CommandBuilder {
        CommandBuilder::new("ffmpeg", vec![240, 360], 2.0)
    }

    #[test]
    fn test_required_profiles_respect_height() {
        let required = required_profiles(&builder(), &video(480), &profiles());
        let ids: Vec<_> = required.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let small = required_profiles(&builder(), &video(200), &profiles());
        assert_eq!(small.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_running_dominates() {
        let media = video(480);
        let required = required_profiles(&builder(), &media, &profiles());
        let jobs = vec![
            job(1, EncodingStatus::Fail, 0),
            job(2, EncodingStatus::Running, 1),
        ];
        assert_eq!(aggregate_status(&media, &jobs, &required), EncodingStatus::Running);
    }

    #[test]
    fn test_terminal_failure_fails_media() {
        let media = video(480);
        let required = required_profiles(&builder(), &media, &profiles());
        let jobs = vec![
            job(1, EncodingStatus::Success, 1),
            job(2, EncodingStatus::Fail, 0),
            job(3, EncodingStatus::Pending, 1),
        ];
        assert_eq!(aggregate_status(&media, &jobs, &required), EncodingStatus::Fail);

        // a retry is still possible
        let retrying = vec![job(2, EncodingStatus::Fail, 1)];
        assert_eq!(aggregate_status(&media, &retrying, &required), EncodingStatus::Pending);
    }

    #[test]
    fn test_success_needs_every_required_profile() {
        let media = video(480);
        let required = required_profiles(&builder(), &media, &profiles());
        let mut jobs = vec![
            job(1, EncodingStatus::Success, 1),
            job(2, EncodingStatus::Success, 1),
        ];
        assert_eq!(aggregate_status(&media, &jobs, &required), EncodingStatus::Pending);

        jobs.push(job(3, EncodingStatus::Success, 1));
        assert_eq!(aggregate_status(&media, &jobs, &required), EncodingStatus::Success);
    }

    #[test]
    fn test_chunk_success_is_not_profile_success() {
        let media = video(240);
        let required = vec![EncodeProfile::new(1, "h264-240", Codec::H264, 240)];
        let mut chunk_job = job(1, EncodingStatus::Success, 1);
        chunk_job.chunk = Some(ChunkDescriptor {
            path: PathBuf::from("/m/00_x.mkv"),
            checksum: "c".into(),
            chunks_info: Default::default(),
        });
        assert_eq!(
            aggregate_status(&media, &[chunk_job.clone()], &required),
            EncodingStatus::Pending
        );

        chunk_job.status = EncodingStatus::Fail;
        chunk_job.retries_remaining = 0;
        let sibling = EncodingJob {
            status: EncodingStatus::Success,
            ..chunk_job.clone()
        };
        assert_eq!(
            aggregate_status(&media, &[chunk_job, sibling], &required),
            EncodingStatus::Fail
        );
    }

    #[test]
    fn test_non_video_is_success() {
        let mut media = SourceMedia::new(MediaId::new("a"), "/m/a/song.mp3");
        media.media_type = MediaType::Audio;
        assert_eq!(aggregate_status(&media, &[], &[]), EncodingStatus::Success);
    }

    #[test]
    fn test_progress_throttle() {
        let mut throttle = ProgressThrottle::new(20);
        let saved: Vec<u32> = (0..45).filter(|_| throttle.tick()).collect();
        assert_eq!(saved, vec![0, 20, 40]);
    }
}
