//! Core data model definitions shared across GridFire crates.

pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod media;
pub mod segment;
pub mod track;

pub use error::{ModelError, Result as ModelResult};
pub use events::{Notification, PipelineEvent};
pub use ids::{JobId, LeaseId, ReleaseId, TrackId, UserId};
pub use job::{Job, JobDraft, JobKind, StageJob};
pub use media::SourceFormat;
pub use segment::{SegmentLookup, SegmentResolution, TrackStreamInfo};
pub use track::{
    ArtifactKind, ByteRange, Cids, Release, Track, TrackEvent, TrackStatus,
};
