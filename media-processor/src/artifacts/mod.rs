//! Derived artifacts: poster, sprite sheet, HLS package and transcript
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


mod hls;
mod sprite;
mod thumbnail;
mod transcribe;

pub use hls::{create_hls, mp4hls_invocation, MASTER_PLAYLIST};
pub use sprite::{produce_sprite, sprite_invocations};
pub use thumbnail::{poster_invocation, produce_poster};
pub use transcribe::{
    audio_invocation, language_code, whisper_invocation, whisper_transcribe, TranscriptionOutcome,
};

use crate::command::Invocation;
use crate::error::Result;
use crate::pipeline::Pipeline;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run a helper tool under the pipeline's runner, so it shares the soft
/// limit, the bounded stderr tail and the task's cancellation.
pub(crate) async fn run_tool(
    p: &Pipeline,
    invocation: &Invocation,
    cancel: &CancellationToken,
) -> Result<String> {
    debug!(command = %invocation.render(), "Running tool");
    Ok(p.runner.run_tool(invocation, cancel.clone()).await?)
}
