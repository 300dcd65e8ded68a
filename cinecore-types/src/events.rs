//! Event type definitions published by the encoding pipeline
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Result, TypesError};
use crate::jobs::EncodingStatus;
use crate::media::{MediaId, ProfileId};

/// Event type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "media.encoded")]
    MediaEncoded,
    #[serde(rename = "media.transcribed")]
    MediaTranscribed,
}

impl EventType {
    /// Subject suffix used on the message bus
    pub fn subject(&self) -> &'static str {
        match self {
            EventType::MediaEncoded => "media.encoded",
            EventType::MediaTranscribed => "media.transcribed",
        }
    }
}

/// Base event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type identifier
    pub event_type: EventType,

    /// Unique event identifier
    pub event_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Source service that published the event
    pub source: String,

    /// Event payload (type depends on event_type)
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self> {
        let payload_value = serde_json::to_value(payload)?;

        Ok(Self {
            event_type,
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload: payload_value,
        })
    }

    /// Deserialize the payload into a specific type
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TypesError::InvalidPayload(e.to_string()))
    }

    /// Validate the event structure
    pub fn validate(&self) -> Result<()> {
        match self.event_type {
            EventType::MediaEncoded => {
                let _: MediaEncodedPayload = self.payload_as()?;
            }
            EventType::MediaTranscribed => {
                let _: MediaTranscribedPayload = self.payload_as()?;
            }
        }
        Ok(())
    }
}

/// Published when a media's aggregate status settles on success or fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEncodedPayload {
    pub media_id: MediaId,
    pub status: EncodingStatus,
    pub profiles: Vec<ProfileId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_file: Option<PathBuf>,
}

/// Published after a subtitle track was generated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTranscribedPayload {
    pub media_id: MediaId,
    pub language_code: String,
    pub subtitle_file: PathBuf,
    pub translate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let payload = MediaTranscribedPayload {
            media_id: MediaId::from("Xy12"),
            language_code: "automatic".to_string(),
            subtitle_file: PathBuf::from("/media/Xy12/subtitles/automatic.vtt"),
            translate: false,
        };

        let event = Event::new(EventType::MediaTranscribed, "media-processor", payload).unwrap();
        assert_eq!(event.event_type, EventType::MediaTranscribed);
        assert_eq!(event.source, "media-processor");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::MediaEncoded).unwrap();
        assert_eq!(json, "\"media.encoded\"");
        assert_eq!(EventType::MediaTranscribed.subject(), "media.transcribed");
    }

    #[test]
    fn test_validate_rejects_mismatched_payload() {
        let event = Event::new(
            EventType::MediaEncoded,
            "media-processor",
            serde_json::json!({ "unrelated": true }),
        )
        .unwrap();

        assert!(matches!(event.validate(), Err(TypesError::InvalidPayload(_))));
    }
}
