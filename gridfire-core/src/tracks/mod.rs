//! Track state store.
//!
//! All writes are conditional on the track's current status and scoped to
//! the fields a stage owns, so an AAC job and an MP3 job finishing at the
//! same moment never overwrite each other. Status changes that publish
//! artifacts (`complete_*`) set the locators and the status in one write.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use gridfire_model::{
    ByteRange, ModelError, Release, ReleaseId, Track, TrackEvent, TrackId, TrackStatus,
    TrackStreamInfo, UserId,
};
use thiserror::Error;

use crate::error::ErrorClass;

pub use memory::MemoryTrackRepository;
#[cfg(feature = "database")]
pub use postgres::PostgresTrackRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("release {0} not found")]
    ReleaseNotFound(ReleaseId),
    #[error("track {0} not found")]
    TrackNotFound(TrackId),
    #[error("track {track} is {status}; {event:?} not allowed")]
    Conflict {
        track: TrackId,
        status: TrackStatus,
        event: TrackEvent,
    },
    #[error("track {0} has not been packaged for streaming")]
    NotStreamable(TrackId),
    #[error("position {position} is outside the release's {len} tracks")]
    Position { position: usize, len: usize },
    #[error("stored record is malformed: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(String),
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::ReleaseNotFound(_)
            | RepositoryError::TrackNotFound(_) => ErrorClass::NotFound,
            RepositoryError::Conflict { .. }
            | RepositoryError::NotStreamable(_)
            | RepositoryError::Corrupt(_) => ErrorClass::Consistency,
            RepositoryError::Position { .. } => ErrorClass::Validation,
            RepositoryError::Database(_) => ErrorClass::Transient,
        }
    }
}

impl From<ModelError> for RepositoryError {
    fn from(err: ModelError) -> Self {
        RepositoryError::Corrupt(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Everything the AAC stage publishes when a track becomes streamable.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingArtifacts {
    pub mp4_cid: String,
    pub hls_cid: String,
    pub duration: f64,
    pub init_range: ByteRange,
    pub segment_list: Vec<ByteRange>,
    pub segment_duration: u32,
    pub segment_timescale: u32,
}

/// Status a track lands in after `event`, whichever legal status it left.
pub fn target_status(event: TrackEvent) -> RepoResult<TrackStatus> {
    TrackStatus::sources(event)
        .first()
        .map(|from| from.apply(event))
        .transpose()?
        .ok_or_else(|| RepositoryError::Corrupt(format!("{event:?} has no source status")))
}

/// Projects the streaming fields of a stored track.
pub fn stream_projection(track: &Track) -> RepoResult<TrackStreamInfo> {
    let not_ready = || RepositoryError::NotStreamable(track.id);
    if track.status != TrackStatus::Stored || track.segment_list.is_empty() {
        return Err(not_ready());
    }
    Ok(TrackStreamInfo {
        duration: track.duration.ok_or_else(not_ready)?,
        cid: track
            .cid(gridfire_model::ArtifactKind::Mp4)
            .ok_or_else(not_ready)?
            .to_string(),
        init_range: track.init_range.ok_or_else(not_ready)?,
        segment_list: track.segment_list.clone(),
        segment_duration: track.segment_duration.ok_or_else(not_ready)?,
        segment_timescale: track.segment_timescale.ok_or_else(not_ready)?,
    })
}

/// Moves the item at `from` to `to`, shifting the ones in between.
pub(crate) fn reorder<T>(items: &mut Vec<T>, from: usize, to: usize) -> RepoResult<()> {
    let len = items.len();
    for position in [from, to] {
        if position >= len {
            return Err(RepositoryError::Position { position, len });
        }
    }
    let item = items.remove(from);
    items.insert(to, item);
    Ok(())
}

#[async_trait]
pub trait TrackRepository: Send + Sync + std::fmt::Debug {
    async fn create_release(&self, owner: UserId, title: &str) -> RepoResult<Release>;

    async fn release(&self, release: ReleaseId) -> RepoResult<Release>;

    /// Appends an empty `pending` slot to the release.
    async fn add_track(&self, release: ReleaseId, title: &str) -> RepoResult<Track>;

    async fn track(&self, release: ReleaseId, track: TrackId) -> RepoResult<Track>;

    /// Looks a track up by id alone, for routes that only carry the track.
    async fn find_track(&self, track: TrackId) -> RepoResult<Track>;

    /// Tracks of a release in position order.
    async fn list_tracks(&self, release: ReleaseId) -> RepoResult<Vec<Track>>;

    /// Streaming projection. Never includes key material or other tracks.
    async fn stream_info(&self, track: TrackId) -> RepoResult<TrackStreamInfo>;

    /// Applies `event` if the current status allows it and returns the new
    /// status. Fails with [`RepositoryError::Conflict`] otherwise.
    async fn transition(
        &self,
        release: ReleaseId,
        track: TrackId,
        event: TrackEvent,
    ) -> RepoResult<TrackStatus>;

    /// Starts a fresh upload, clearing every artifact of a previous attempt.
    async fn begin_upload(&self, release: ReleaseId, track: TrackId) -> RepoResult<()>;

    /// `uploading -> uploaded` together with the source locator.
    async fn complete_upload(
        &self,
        release: ReleaseId,
        track: TrackId,
        src_cid: &str,
    ) -> RepoResult<()>;

    /// `encoding -> encoded` together with the archival FLAC locator.
    async fn complete_encode(
        &self,
        release: ReleaseId,
        track: TrackId,
        flac_cid: &str,
    ) -> RepoResult<()>;

    /// `transcoding -> stored` together with every streaming field.
    async fn complete_transcode(
        &self,
        release: ReleaseId,
        track: TrackId,
        artifacts: &StreamingArtifacts,
    ) -> RepoResult<()>;

    /// Sets only the MP3 locator; the status is left alone.
    async fn record_mp3(
        &self,
        release: ReleaseId,
        track: TrackId,
        mp3_cid: &str,
    ) -> RepoResult<()>;

    /// Moves the track to `error` if it is still in a state that can fail.
    /// Returns whether the status changed.
    async fn mark_error(&self, release: ReleaseId, track: TrackId) -> RepoResult<bool> {
        match self.transition(release, track, TrackEvent::Failed).await {
            Ok(_) => Ok(true),
            Err(RepositoryError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reorders the release's track list and returns it in the new order.
    async fn move_track(
        &self,
        release: ReleaseId,
        from: usize,
        to: usize,
    ) -> RepoResult<Vec<Track>>;

    async fn delete_track(&self, release: ReleaseId, track: TrackId) -> RepoResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_has_a_single_target() {
        assert_eq!(
            target_status(TrackEvent::EncodeStarted).unwrap(),
            TrackStatus::Encoding
        );
        assert_eq!(target_status(TrackEvent::Failed).unwrap(), TrackStatus::Error);
        assert_eq!(
            target_status(TrackEvent::DeleteRequested).unwrap(),
            TrackStatus::Deleting
        );
    }

    #[test]
    fn reorder_shifts_neighbours() {
        let mut items = vec!['a', 'b', 'c', 'd'];
        reorder(&mut items, 3, 1).unwrap();
        assert_eq!(items, vec!['a', 'd', 'b', 'c']);
        assert!(matches!(
            reorder(&mut items, 0, 4),
            Err(RepositoryError::Position { position: 4, len: 4 })
        ));
    }

    #[test]
    fn unpackaged_tracks_have_no_stream_projection() {
        let track = Track::new_slot(ReleaseId::new(), "Intro", 0);
        assert!(matches!(
            stream_projection(&track),
            Err(RepositoryError::NotStreamable(_))
        ));
    }
}
