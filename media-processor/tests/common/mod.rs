//! Shared fixtures: stand-in tool scripts, memory store and memory queue
#![allow(dead_code)]

use cinecore_config::PipelineConfig;
use cinecore_types::{Codec, EncodeProfile, Lane, MediaId, SourceMedia, TaskEnvelope};
use media_processor::pipeline::Pipeline;
use media_processor::retry::RetryConfig;
use media_processor::store::{JobStore, MemoryJobStore};
use media_processor::worker::handle_task;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use task_queue_client::MemoryTaskQueue;
use tempfile::TempDir;

/// ffmpeg stand-in: prints one progress line and writes its last argument
pub const FFMPEG_OK: &str = r#"
for last; do :; done
echo "frame=  250 fps=50 q=28.0 size=  512kB time=00:00:10.00 bitrate= 419.4kbits/s speed=2x" >&2
case "$last" in
  /dev/null|-) ;;
  *) echo data > "$last" ;;
esac
exit 0
"#;

/// ffmpeg stand-in rejecting its input
pub const FFMPEG_BAD_INPUT: &str = r#"
echo "/media/in.mp4: Invalid data found when processing input" >&2
exit 1
"#;

/// ffmpeg stand-in failing with a transient error
pub const FFMPEG_FLAKY: &str = r#"
echo "av_interleaved_write_frame(): Connection reset by peer" >&2
exit 1
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// ffprobe stand-in describing a 25 fps h264 video with audio
pub fn ffprobe_video(duration: f64, height: u32) -> String {
    let width = height * 16 / 9;
    format!(
        r#"
cat <<'JSON'
{{"streams":[{{"codec_type":"video","codec_name":"h264","width":{w},"height":{h},"r_frame_rate":"25/1","bit_rate":"1200000","duration":"{d}"}},{{"codec_type":"audio","codec_name":"aac","bit_rate":"128000","sample_rate":"48000","channels":2}}],"format":{{"format_name":"mov,mp4,m4a,3gp,3g2,mj2","duration":"{d}"}}}}
JSON
"#,
        w = width,
        h = height,
        d = duration
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub pipeline: Pipeline,
}

pub struct HarnessBuilder {
    dir: TempDir,
    config: PipelineConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.paths.media_root = dir.path().join("media");
        config.paths.hls_root = dir.path().join("hls");
        config.paths.temp_dir = dir.path().join("tmp");
        config.worker.name = "test-worker".to_string();
        config.artifacts.produce_poster = false;
        config.artifacts.produce_sprites = false;
        config.artifacts.produce_hls = false;
        std::fs::create_dir_all(&config.paths.media_root).unwrap();

        let ffmpeg = write_script(dir.path(), "ffmpeg", FFMPEG_OK);
        let ffprobe = write_script(dir.path(), "ffprobe", &ffprobe_video(400.0, 480));
        config.tools.ffmpeg = ffmpeg;
        config.tools.ffprobe = ffprobe;

        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn ffmpeg(mut self, body: &str) -> Self {
        self.config.tools.ffmpeg = write_script(self.dir.path(), "ffmpeg", body);
        self
    }

    pub fn ffprobe(mut self, body: &str) -> Self {
        self.config.tools.ffprobe = write_script(self.dir.path(), "ffprobe", body);
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut PipelineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let pipeline = Pipeline::new(self.config, store.clone(), queue.clone())
            .with_queue_retry(RetryConfig::none());
        Harness {
            dir: self.dir,
            store,
            queue,
            pipeline,
        }
    }
}

impl Harness {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// h264 240/360/480/720 profiles, ids 1 to 4
    pub async fn standard_profiles(&self) {
        for (id, res) in [(1, 240), (2, 360), (3, 480), (4, 720)] {
            let profile = EncodeProfile::new(id, format!("h264-{}", res), Codec::H264, res);
            self.store.save_profile(&profile).await.unwrap();
        }
    }

    /// Source file on disk plus its unprobed record
    pub async fn upload(&self, token: &str) -> MediaId {
        let id = MediaId::from(token);
        let dir = self.pipeline.config().paths.media_root.join(token);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("movie.mp4");
        std::fs::write(&file, b"not really a movie").unwrap();
        let media = SourceMedia::new(id.clone(), file);
        self.store.save_media(&media).await.unwrap();
        id
    }

    pub async fn media(&self, id: &MediaId) -> SourceMedia {
        self.store.get_media(id).await.unwrap().unwrap()
    }

    /// Handle every due task of a lane, including ones they enqueue
    pub async fn drain(&self, lane: Lane) -> Vec<TaskEnvelope> {
        let mut handled = Vec::new();
        while let Some(delivery) = self.queue.try_next(lane).unwrap() {
            let task = delivery.task.clone();
            let _ = handle_task(&self.pipeline, &task).await;
            delivery.ack().await.unwrap();
            handled.push(task);
        }
        handled
    }
}
