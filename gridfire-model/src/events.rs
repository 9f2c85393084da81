use serde::{Deserialize, Serialize};

use crate::{
    ids::{TrackId, UserId},
    track::TrackStatus,
};

/// Ephemeral progress and status messages pushed to the owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PipelineEvent {
    TrackStatus {
        track_id: TrackId,
        status: TrackStatus,
    },
    UploadProgress {
        track_id: TrackId,
        percent: u8,
    },
    #[serde(rename = "encodingProgressFLAC")]
    EncodingProgressFlac { track_id: TrackId, percent: u8 },
    #[serde(rename = "storingProgressFLAC")]
    StoringProgressFlac { track_id: TrackId, percent: u8 },
    #[serde(rename = "transcodingStartedAAC")]
    TranscodingStartedAac { track_id: TrackId },
    #[serde(rename = "transcodingCompleteAAC")]
    TranscodingCompleteAac {
        track_id: TrackId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_name: Option<String>,
    },
    #[serde(rename = "transcodingStartedMP3")]
    TranscodingStartedMp3 { track_id: TrackId },
    #[serde(rename = "transcodingCompleteMP3")]
    TranscodingCompleteMp3 {
        track_id: TrackId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_name: Option<String>,
    },
    PipelineError {
        track_id: TrackId,
        stage: String,
        message: String,
    },
}

impl PipelineEvent {
    /// Wire name, also used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::TrackStatus { .. } => "trackStatus",
            PipelineEvent::UploadProgress { .. } => "uploadProgress",
            PipelineEvent::EncodingProgressFlac { .. } => "encodingProgressFLAC",
            PipelineEvent::StoringProgressFlac { .. } => "storingProgressFLAC",
            PipelineEvent::TranscodingStartedAac { .. } => "transcodingStartedAAC",
            PipelineEvent::TranscodingCompleteAac { .. } => {
                "transcodingCompleteAAC"
            }
            PipelineEvent::TranscodingStartedMp3 { .. } => "transcodingStartedMP3",
            PipelineEvent::TranscodingCompleteMp3 { .. } => {
                "transcodingCompleteMP3"
            }
            PipelineEvent::PipelineError { .. } => "pipelineError",
        }
    }

    pub fn track_id(&self) -> TrackId {
        match self {
            PipelineEvent::TrackStatus { track_id, .. }
            | PipelineEvent::UploadProgress { track_id, .. }
            | PipelineEvent::EncodingProgressFlac { track_id, .. }
            | PipelineEvent::StoringProgressFlac { track_id, .. }
            | PipelineEvent::TranscodingStartedAac { track_id }
            | PipelineEvent::TranscodingCompleteAac { track_id, .. }
            | PipelineEvent::TranscodingStartedMp3 { track_id }
            | PipelineEvent::TranscodingCompleteMp3 { track_id, .. }
            | PipelineEvent::PipelineError { track_id, .. } => *track_id,
        }
    }

    pub fn status(track_id: TrackId, status: TrackStatus) -> Self {
        PipelineEvent::TrackStatus { track_id, status }
    }
}

/// An event addressed to one user, as relayed between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: UserId,
    pub event: PipelineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_their_wire_name_as_type() {
        let track_id = TrackId::new();
        let cases = [
            PipelineEvent::status(track_id, TrackStatus::Encoding),
            PipelineEvent::EncodingProgressFlac {
                track_id,
                percent: 40,
            },
            PipelineEvent::TranscodingCompleteAac {
                track_id,
                track_name: Some("Intro".into()),
            },
            PipelineEvent::PipelineError {
                track_id,
                stage: "aac".into(),
                message: "encoder exited".into(),
            },
        ];

        for event in cases {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.name());
            assert_eq!(value["trackId"], track_id.to_string());
            let back: PipelineEvent = serde_json::from_value(value).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn status_event_serializes_lowercase_status() {
        let event = PipelineEvent::status(TrackId::new(), TrackStatus::Error);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "error");
    }
}
