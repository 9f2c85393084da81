//! Pipeline job messages.
//!
//! A [`Job`] can only be obtained through [`JobDraft::build`] (or by
//! deserializing a message that already carried every field), so a job with
//! a missing parameter never reaches a queue.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{ReleaseId, TrackId, UserId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "encodeFLAC")]
    EncodeFlac,
    #[serde(rename = "transcodeAAC")]
    TranscodeAac,
    #[serde(rename = "transcodeMP3")]
    TranscodeMp3,
}

impl JobKind {
    pub const ALL: [JobKind; 3] =
        [JobKind::EncodeFlac, JobKind::TranscodeAac, JobKind::TranscodeMp3];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::EncodeFlac => "encodeFLAC",
            JobKind::TranscodeAac => "transcodeAAC",
            JobKind::TranscodeMp3 => "transcodeMP3",
        }
    }

    /// Short stage label used in logs and error events.
    pub fn stage(self) -> &'static str {
        match self {
            JobKind::EncodeFlac => "flac",
            JobKind::TranscodeAac => "aac",
            JobKind::TranscodeMp3 => "mp3",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ModelError::UnknownVariant {
                kind: "job kind",
                value: s.to_string(),
            })
    }
}

/// Parameters shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJob {
    pub user_id: UserId,
    pub release_id: ReleaseId,
    pub track_id: TrackId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    /// Locator of the artifact this stage reads.
    pub cid: String,
}

/// One immutable stage invocation, tagged by `job` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job")]
pub enum Job {
    #[serde(rename = "encodeFLAC")]
    EncodeFlac(StageJob),
    #[serde(rename = "transcodeAAC")]
    TranscodeAac(StageJob),
    #[serde(rename = "transcodeMP3")]
    TranscodeMp3(StageJob),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::EncodeFlac(_) => JobKind::EncodeFlac,
            Job::TranscodeAac(_) => JobKind::TranscodeAac,
            Job::TranscodeMp3(_) => JobKind::TranscodeMp3,
        }
    }

    pub fn params(&self) -> &StageJob {
        match self {
            Job::EncodeFlac(params)
            | Job::TranscodeAac(params)
            | Job::TranscodeMp3(params) => params,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.params().track_id
    }

    fn from_parts(kind: JobKind, params: StageJob) -> Self {
        match kind {
            JobKind::EncodeFlac => Job::EncodeFlac(params),
            JobKind::TranscodeAac => Job::TranscodeAac(params),
            JobKind::TranscodeMp3 => Job::TranscodeMp3(params),
        }
    }
}

/// Builder that collects job parameters and refuses to produce a [`Job`]
/// until every required one is present.
#[derive(Debug, Clone, Default)]
pub struct JobDraft {
    kind: Option<JobKind>,
    user_id: Option<UserId>,
    release_id: Option<ReleaseId>,
    track_id: Option<TrackId>,
    track_name: Option<String>,
    cid: Option<String>,
}

impl JobDraft {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn release(mut self, release_id: ReleaseId) -> Self {
        self.release_id = Some(release_id);
        self
    }

    pub fn track(mut self, track_id: TrackId) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn track_name(mut self, name: Option<String>) -> Self {
        self.track_name = name;
        self
    }

    pub fn cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    /// Starts a follow-up draft that inherits identity fields from `params`.
    pub fn follow_up(kind: JobKind, params: &StageJob) -> Self {
        Self::new(kind)
            .user(params.user_id)
            .release(params.release_id)
            .track(params.track_id)
            .track_name(params.track_name.clone())
    }

    pub fn build(self) -> Result<Job, ModelError> {
        let mut missing = Vec::new();
        if self.kind.is_none() {
            missing.push("job");
        }
        if self.user_id.is_none() {
            missing.push("userId");
        }
        if self.release_id.is_none() {
            missing.push("releaseId");
        }
        if self.track_id.is_none() {
            missing.push("trackId");
        }
        if self.cid.as_deref().is_none_or(|cid| cid.trim().is_empty()) {
            missing.push("cid");
        }

        match (self.kind, self.user_id, self.release_id, self.track_id, self.cid)
        {
            (Some(kind), Some(user_id), Some(release_id), Some(track_id), Some(cid))
                if missing.is_empty() =>
            {
                Ok(Job::from_parts(
                    kind,
                    StageJob {
                        user_id,
                        release_id,
                        track_id,
                        track_name: self.track_name,
                        cid,
                    },
                ))
            }
            _ => Err(ModelError::MissingJobFields(missing)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> JobDraft {
        JobDraft::new(JobKind::EncodeFlac)
            .user(UserId::new())
            .release(ReleaseId::new())
            .track(TrackId::new())
            .cid("r/t.wav")
    }

    #[test]
    fn complete_draft_builds() {
        let job = complete().build().unwrap();
        assert_eq!(job.kind(), JobKind::EncodeFlac);
        assert_eq!(job.params().cid, "r/t.wav");
    }

    #[test]
    fn every_missing_field_is_reported() {
        let err = JobDraft::default().cid("  ").build().unwrap_err();
        assert_eq!(
            err,
            ModelError::MissingJobFields(vec![
                "job",
                "userId",
                "releaseId",
                "trackId",
                "cid"
            ])
        );

        let err = JobDraft::new(JobKind::TranscodeMp3)
            .user(UserId::new())
            .track(TrackId::new())
            .cid("r/t")
            .build()
            .unwrap_err();
        assert_eq!(err, ModelError::MissingJobFields(vec!["releaseId"]));
    }

    #[test]
    fn wire_format_uses_job_tag_and_camel_case() {
        let job = complete().track_name(Some("Intro".into())).build().unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job"], "encodeFLAC");
        assert_eq!(value["trackName"], "Intro");
        assert!(value.get("userId").is_some());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn messages_without_required_fields_do_not_deserialize() {
        let raw = serde_json::json!({
            "job": "transcodeAAC",
            "userId": UserId::new(),
            "trackId": TrackId::new(),
            "cid": "r/t",
        });
        assert!(serde_json::from_value::<Job>(raw).is_err());
    }

    #[test]
    fn follow_up_inherits_identity() {
        let job = complete().track_name(Some("Intro".into())).build().unwrap();
        let next = JobDraft::follow_up(JobKind::TranscodeAac, job.params())
            .cid("r/t")
            .build()
            .unwrap();
        assert_eq!(next.track_id(), job.track_id());
        assert_eq!(next.params().track_name.as_deref(), Some("Intro"));
    }
}
