//! Media Processor - video transcoding pipeline
//!
//! Probes uploaded media, plans chunked or whole-file encodes, runs ffmpeg
//! under the task queue, tracks every job record and reconciles them.
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


pub mod artifacts;
pub mod assembler;
pub mod chunker;
pub mod command;
pub mod encoder;
pub mod error;
pub mod jobs;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod reconcile;
pub mod retry;
pub mod runner;
pub mod server;
pub mod store;
pub mod worker;

pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
