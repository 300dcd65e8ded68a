//! Parsers for external tool diagnostic output
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


use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Extracts elapsed media time from one line of tool output
pub trait ProgressParser: Send + Sync {
    /// Seconds of media processed so far, if the line carries them
    fn parse(&self, line: &str) -> Option<f64>;
}

/// Recovers output file names from segmentation output
pub trait SegmentParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<PathBuf>;
}

fn timecode_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").ok())
        .as_ref()
}

fn segment_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Opening '(.+)' for writing").ok())
        .as_ref()
}

/// ffmpeg `time=HH:MM:SS.ms` progress fields
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegTimecodeParser;

impl ProgressParser for FfmpegTimecodeParser {
    fn parse(&self, line: &str) -> Option<f64> {
        let caps = timecode_regex()?.captures(line)?;
        let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
        let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
        let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    }
}

/// ffmpeg segment muxer `Opening '<file>' for writing` markers
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegSegmentParser;

impl SegmentParser for FfmpegSegmentParser {
    fn parse(&self, line: &str) -> Option<PathBuf> {
        let caps = segment_regex()?.captures(line)?;
        Some(PathBuf::from(caps.get(1)?.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timecode_parsing() {
        let line = "frame= 1200 fps= 60 q=28.0 size=    2048kB time=00:01:05.50 bitrate= 256.0kbits/s speed=2.1x";
        assert_eq!(FfmpegTimecodeParser.parse(line), Some(65.5));
        assert_eq!(FfmpegTimecodeParser.parse("time=01:00:00"), Some(3600.0));
        assert_eq!(FfmpegTimecodeParser.parse("Press [q] to stop"), None);
        assert_eq!(FfmpegTimecodeParser.parse("time=N/A bitrate=N/A"), None);
    }

    #[test]
    fn test_segment_marker() {
        let line = "[segment @ 0x55d] Opening '03_Ab12_movie.mp4.mkv' for writing";
        assert_eq!(
            FfmpegSegmentParser.parse(line),
            Some(PathBuf::from("03_Ab12_movie.mp4.mkv"))
        );
        assert_eq!(FfmpegSegmentParser.parse("Output #0, segment"), None);
    }
}
