//! Track lifecycle: the processing status graph and the persisted record.
//!
//! [`TrackStatus::apply`] is the only place that decides whether a status
//! change is legal. Repositories and the pipeline controller derive their
//! guards from it rather than keeping their own tables.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{ReleaseId, TrackId, UserId},
};

/// Processing status of a single track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Pending,
    Uploading,
    Uploaded,
    Encoding,
    Encoded,
    Transcoding,
    Stored,
    Error,
    Deleting,
}

/// Something that happened to a track and may move it along the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackEvent {
    UploadStarted,
    UploadCompleted,
    EncodeStarted,
    EncodeCompleted,
    TranscodeStarted,
    TranscodeCompleted,
    Failed,
    DeleteRequested,
}

impl TrackStatus {
    pub const ALL: [TrackStatus; 9] = [
        TrackStatus::Pending,
        TrackStatus::Uploading,
        TrackStatus::Uploaded,
        TrackStatus::Encoding,
        TrackStatus::Encoded,
        TrackStatus::Transcoding,
        TrackStatus::Stored,
        TrackStatus::Error,
        TrackStatus::Deleting,
    ];

    /// The single authoritative transition function.
    ///
    /// Re-entering `encoding` or `transcoding` is legal so that a job
    /// redelivered after a worker crash can start over from scratch. A track
    /// in `error` may begin a fresh upload; nothing else leaves `error`.
    pub fn apply(self, event: TrackEvent) -> Result<TrackStatus, ModelError> {
        use TrackEvent as E;
        use TrackStatus as S;

        let next = match (self, event) {
            (S::Pending | S::Error, E::UploadStarted) => S::Uploading,
            (S::Uploading, E::UploadCompleted) => S::Uploaded,
            (S::Uploaded | S::Encoding, E::EncodeStarted) => S::Encoding,
            (S::Encoding, E::EncodeCompleted) => S::Encoded,
            (S::Encoded | S::Transcoding, E::TranscodeStarted) => {
                S::Transcoding
            }
            (S::Transcoding, E::TranscodeCompleted) => S::Stored,
            (from, E::Failed) if from == S::Pending || from.is_in_progress() => {
                S::Error
            }
            (from, E::DeleteRequested) if from != S::Deleting => S::Deleting,
            (from, event) => {
                return Err(ModelError::InvalidTransition { from, event });
            }
        };
        Ok(next)
    }

    pub fn accepts(self, event: TrackEvent) -> bool {
        self.apply(event).is_ok()
    }

    /// Every status from which `event` is legal.
    pub fn sources(event: TrackEvent) -> Vec<TrackStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.accepts(event))
            .collect()
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            TrackStatus::Uploading
                | TrackStatus::Uploaded
                | TrackStatus::Encoding
                | TrackStatus::Encoded
                | TrackStatus::Transcoding
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrackStatus::Stored | TrackStatus::Error)
    }

    /// Position along the happy path; `None` for `error` and `deleting`.
    pub fn stage_rank(self) -> Option<u8> {
        match self {
            TrackStatus::Pending => Some(0),
            TrackStatus::Uploading => Some(1),
            TrackStatus::Uploaded => Some(2),
            TrackStatus::Encoding => Some(3),
            TrackStatus::Encoded => Some(4),
            TrackStatus::Transcoding => Some(5),
            TrackStatus::Stored => Some(6),
            TrackStatus::Error | TrackStatus::Deleting => None,
        }
    }

    /// True when `self` lies strictly beyond `other` on the happy path.
    pub fn is_past(self, other: TrackStatus) -> bool {
        match (self.stage_rank(), other.stage_rank()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Uploading => "uploading",
            TrackStatus::Uploaded => "uploaded",
            TrackStatus::Encoding => "encoding",
            TrackStatus::Encoded => "encoded",
            TrackStatus::Transcoding => "transcoding",
            TrackStatus::Stored => "stored",
            TrackStatus::Error => "error",
            TrackStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownVariant {
                kind: "track status",
                value: s.to_string(),
            })
    }
}

/// Kinds of stored artifact a track can reference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Src,
    Flac,
    Mp4,
    Mp3,
    Hls,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Src,
        ArtifactKind::Flac,
        ArtifactKind::Mp4,
        ArtifactKind::Mp3,
        ArtifactKind::Hls,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Src => "src",
            ArtifactKind::Flac => "flac",
            ArtifactKind::Mp4 => "mp4",
            ArtifactKind::Mp3 => "mp3",
            ArtifactKind::Hls => "hls",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact kind to content locator. Serialized as a plain JSON object.
pub type Cids = BTreeMap<ArtifactKind, String>;

/// Inclusive byte range, rendered the way HTTP `Range` headers want it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Inclusive `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(end >= start);
        Self { start, end }
    }

    /// Range covering `len` bytes starting at `offset`. `len` must be non-zero.
    pub fn at(offset: u64, len: u64) -> Self {
        Self {
            start: offset,
            end: offset + len.saturating_sub(1),
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for ByteRange {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidByteRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.parse().map_err(|_| invalid())?;
        let end: u64 = end.parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for ByteRange {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteRange> for String {
    fn from(range: ByteRange) -> Self {
        range.to_string()
    }
}

/// A release groups tracks under one owning account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: ReleaseId,
    pub owner: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Release {
    pub fn new(owner: UserId, title: impl Into<String>) -> Self {
        Self {
            id: ReleaseId::new(),
            owner,
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

/// One audio item within a release together with its derived artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    pub release_id: ReleaseId,
    pub title: String,
    pub position: i32,
    pub status: TrackStatus,
    pub duration: Option<f64>,
    pub cids: Cids,
    pub init_range: Option<ByteRange>,
    pub segment_list: Vec<ByteRange>,
    pub segment_duration: Option<u32>,
    pub segment_timescale: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Track {
    /// A fresh, empty slot in `pending`.
    pub fn new_slot(
        release_id: ReleaseId,
        title: impl Into<String>,
        position: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TrackId::new(),
            release_id,
            title: title.into(),
            position,
            status: TrackStatus::Pending,
            duration: None,
            cids: Cids::new(),
            init_range: None,
            segment_list: Vec::new(),
            segment_duration: None,
            segment_timescale: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn cid(&self, kind: ArtifactKind) -> Option<&str> {
        self.cids.get(&kind).map(String::as_str)
    }

    /// Checks the record-level invariants a reader must never see broken.
    pub fn is_consistent(&self) -> bool {
        let stored_has_media = self.status != TrackStatus::Stored
            || (self.cid(ArtifactKind::Mp4).is_some()
                && self.duration.is_some()
                && !self.segment_list.is_empty());
        let segments_follow_init =
            self.segment_list.is_empty() || self.init_range.is_some();
        stored_has_media && segments_follow_init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_PATH: [(TrackStatus, TrackEvent, TrackStatus); 6] = [
        (
            TrackStatus::Pending,
            TrackEvent::UploadStarted,
            TrackStatus::Uploading,
        ),
        (
            TrackStatus::Uploading,
            TrackEvent::UploadCompleted,
            TrackStatus::Uploaded,
        ),
        (
            TrackStatus::Uploaded,
            TrackEvent::EncodeStarted,
            TrackStatus::Encoding,
        ),
        (
            TrackStatus::Encoding,
            TrackEvent::EncodeCompleted,
            TrackStatus::Encoded,
        ),
        (
            TrackStatus::Encoded,
            TrackEvent::TranscodeStarted,
            TrackStatus::Transcoding,
        ),
        (
            TrackStatus::Transcoding,
            TrackEvent::TranscodeCompleted,
            TrackStatus::Stored,
        ),
    ];

    #[test]
    fn happy_path_moves_forward_one_rank_at_a_time() {
        for (from, event, to) in HAPPY_PATH {
            assert_eq!(from.apply(event), Ok(to));
            assert_eq!(
                to.stage_rank().unwrap(),
                from.stage_rank().unwrap() + 1
            );
        }
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let err = TrackStatus::Uploaded
            .apply(TrackEvent::TranscodeStarted)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::InvalidTransition {
                from: TrackStatus::Uploaded,
                event: TrackEvent::TranscodeStarted
            }
        ));
        assert!(!TrackStatus::Stored.accepts(TrackEvent::EncodeStarted));
        assert!(!TrackStatus::Encoded.accepts(TrackEvent::EncodeCompleted));
    }

    #[test]
    fn failure_is_reachable_from_every_non_terminal_state() {
        for status in TrackStatus::ALL {
            let expected = !status.is_terminal() && status != TrackStatus::Deleting;
            assert_eq!(status.accepts(TrackEvent::Failed), expected, "{status}");
        }
    }

    #[test]
    fn only_error_and_pending_may_begin_an_upload() {
        assert_eq!(
            TrackStatus::sources(TrackEvent::UploadStarted),
            vec![TrackStatus::Pending, TrackStatus::Error]
        );
    }

    #[test]
    fn deleting_is_reachable_once() {
        assert_eq!(
            TrackStatus::Stored.apply(TrackEvent::DeleteRequested),
            Ok(TrackStatus::Deleting)
        );
        assert!(!TrackStatus::Deleting.accepts(TrackEvent::DeleteRequested));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in TrackStatus::ALL {
            assert_eq!(status.as_str().parse::<TrackStatus>(), Ok(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("archived".parse::<TrackStatus>().is_err());
    }

    #[test]
    fn byte_ranges_parse_like_http_ranges() {
        let range: ByteRange = "0-1023".parse().unwrap();
        assert_eq!(range.len(), 1024);
        assert_eq!(ByteRange::at(1024, 10).to_string(), "1024-1033");
        assert!("10-2".parse::<ByteRange>().is_err());
        assert!("10".parse::<ByteRange>().is_err());
    }

    #[test]
    fn stored_track_without_mp4_is_inconsistent() {
        let mut track = Track::new_slot(ReleaseId::new(), "Intro", 0);
        track.status = TrackStatus::Stored;
        track.duration = Some(180.0);
        track.init_range = Some(ByteRange::at(0, 100));
        track.segment_list = vec![ByteRange::at(100, 50)];
        assert!(!track.is_consistent());

        track
            .cids
            .insert(ArtifactKind::Mp4, "r/t/track.mp4".to_string());
        assert!(track.is_consistent());
    }

    #[test]
    fn cids_serialize_as_named_keys() {
        let mut track = Track::new_slot(ReleaseId::new(), "Intro", 0);
        track.cids.insert(ArtifactKind::Flac, "r/t".into());
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json["cids"]["flac"], "r/t");
        assert_eq!(json["status"], "pending");
    }
}
