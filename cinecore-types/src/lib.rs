//! Cinecore Types
//!
//! Shared type definitions for media records, encoding jobs, task
//! envelopes and events used across the encoding pipeline.
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


pub mod error;
pub mod events;
pub mod jobs;
pub mod media;
pub mod tasks;

pub use error::*;
pub use events::*;
pub use jobs::*;
pub use media::*;
pub use tasks::*;
