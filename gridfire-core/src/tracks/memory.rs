use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use gridfire_model::{
    ArtifactKind, Release, ReleaseId, Track, TrackEvent, TrackId, TrackStatus,
    TrackStreamInfo, UserId,
};
use parking_lot::RwLock;

use super::{
    RepoResult, RepositoryError, StreamingArtifacts, TrackRepository, reorder,
    stream_projection,
};

#[derive(Debug, Default)]
struct State {
    releases: HashMap<ReleaseId, Release>,
    tracks: HashMap<TrackId, Track>,
}

impl State {
    fn scoped(&mut self, release: ReleaseId, track: TrackId) -> RepoResult<&mut Track> {
        self.tracks
            .get_mut(&track)
            .filter(|t| t.release_id == release)
            .ok_or(RepositoryError::TrackNotFound(track))
    }

    fn ordered(&self, release: ReleaseId) -> Vec<Track> {
        let mut tracks: Vec<Track> = self
            .tracks
            .values()
            .filter(|t| t.release_id == release)
            .cloned()
            .collect();
        tracks.sort_by_key(|t| (t.position, t.created_at));
        tracks
    }
}

/// Applies `event` to `track` in place, the way the SQL conditional update
/// does.
fn apply(track: &mut Track, event: TrackEvent) -> RepoResult<TrackStatus> {
    let next = track
        .status
        .apply(event)
        .map_err(|_| RepositoryError::Conflict {
            track: track.id,
            status: track.status,
            event,
        })?;
    track.status = next;
    track.updated_at = Utc::now();
    Ok(next)
}

/// Track store held in process memory. Each write happens under one lock,
/// so readers never see a half-applied stage.
#[derive(Debug, Default)]
pub struct MemoryTrackRepository {
    state: RwLock<State>,
}

impl MemoryTrackRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackRepository for MemoryTrackRepository {
    async fn create_release(&self, owner: UserId, title: &str) -> RepoResult<Release> {
        let release = Release::new(owner, title);
        self.state
            .write()
            .releases
            .insert(release.id, release.clone());
        Ok(release)
    }

    async fn release(&self, release: ReleaseId) -> RepoResult<Release> {
        self.state
            .read()
            .releases
            .get(&release)
            .cloned()
            .ok_or(RepositoryError::ReleaseNotFound(release))
    }

    async fn add_track(&self, release: ReleaseId, title: &str) -> RepoResult<Track> {
        let mut state = self.state.write();
        if !state.releases.contains_key(&release) {
            return Err(RepositoryError::ReleaseNotFound(release));
        }
        let position = state.ordered(release).len();
        let track = Track::new_slot(release, title, position as i32);
        state.tracks.insert(track.id, track.clone());
        Ok(track)
    }

    async fn track(&self, release: ReleaseId, track: TrackId) -> RepoResult<Track> {
        self.state
            .read()
            .tracks
            .get(&track)
            .filter(|t| t.release_id == release)
            .cloned()
            .ok_or(RepositoryError::TrackNotFound(track))
    }

    async fn find_track(&self, track: TrackId) -> RepoResult<Track> {
        self.state
            .read()
            .tracks
            .get(&track)
            .cloned()
            .ok_or(RepositoryError::TrackNotFound(track))
    }

    async fn list_tracks(&self, release: ReleaseId) -> RepoResult<Vec<Track>> {
        let state = self.state.read();
        if !state.releases.contains_key(&release) {
            return Err(RepositoryError::ReleaseNotFound(release));
        }
        Ok(state.ordered(release))
    }

    async fn stream_info(&self, track: TrackId) -> RepoResult<TrackStreamInfo> {
        let state = self.state.read();
        let track = state
            .tracks
            .get(&track)
            .ok_or(RepositoryError::TrackNotFound(track))?;
        stream_projection(track)
    }

    async fn transition(
        &self,
        release: ReleaseId,
        track: TrackId,
        event: TrackEvent,
    ) -> RepoResult<TrackStatus> {
        let mut state = self.state.write();
        apply(state.scoped(release, track)?, event)
    }

    async fn begin_upload(&self, release: ReleaseId, track: TrackId) -> RepoResult<()> {
        let mut state = self.state.write();
        let record = state.scoped(release, track)?;
        apply(record, TrackEvent::UploadStarted)?;
        record.cids.clear();
        record.duration = None;
        record.init_range = None;
        record.segment_list.clear();
        record.segment_duration = None;
        record.segment_timescale = None;
        Ok(())
    }

    async fn complete_upload(
        &self,
        release: ReleaseId,
        track: TrackId,
        src_cid: &str,
    ) -> RepoResult<()> {
        let mut state = self.state.write();
        let record = state.scoped(release, track)?;
        apply(record, TrackEvent::UploadCompleted)?;
        record.cids.insert(ArtifactKind::Src, src_cid.to_string());
        Ok(())
    }

    async fn complete_encode(
        &self,
        release: ReleaseId,
        track: TrackId,
        flac_cid: &str,
    ) -> RepoResult<()> {
        let mut state = self.state.write();
        let record = state.scoped(release, track)?;
        apply(record, TrackEvent::EncodeCompleted)?;
        record.cids.insert(ArtifactKind::Flac, flac_cid.to_string());
        Ok(())
    }

    async fn complete_transcode(
        &self,
        release: ReleaseId,
        track: TrackId,
        artifacts: &StreamingArtifacts,
    ) -> RepoResult<()> {
        let mut state = self.state.write();
        let record = state.scoped(release, track)?;
        apply(record, TrackEvent::TranscodeCompleted)?;
        record
            .cids
            .insert(ArtifactKind::Mp4, artifacts.mp4_cid.clone());
        record
            .cids
            .insert(ArtifactKind::Hls, artifacts.hls_cid.clone());
        record.duration = Some(artifacts.duration);
        record.init_range = Some(artifacts.init_range);
        record.segment_list = artifacts.segment_list.clone();
        record.segment_duration = Some(artifacts.segment_duration);
        record.segment_timescale = Some(artifacts.segment_timescale);
        Ok(())
    }

    async fn record_mp3(
        &self,
        release: ReleaseId,
        track: TrackId,
        mp3_cid: &str,
    ) -> RepoResult<()> {
        let mut state = self.state.write();
        let record = state.scoped(release, track)?;
        if record.status == TrackStatus::Deleting {
            return Err(RepositoryError::Conflict {
                track,
                status: record.status,
                event: TrackEvent::TranscodeCompleted,
            });
        }
        record.cids.insert(ArtifactKind::Mp3, mp3_cid.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn move_track(
        &self,
        release: ReleaseId,
        from: usize,
        to: usize,
    ) -> RepoResult<Vec<Track>> {
        let mut state = self.state.write();
        if !state.releases.contains_key(&release) {
            return Err(RepositoryError::ReleaseNotFound(release));
        }
        let mut ordered = state.ordered(release);
        reorder(&mut ordered, from, to)?;
        let now = Utc::now();
        for (position, track) in ordered.iter_mut().enumerate() {
            track.position = position as i32;
            track.updated_at = now;
            state.tracks.insert(track.id, track.clone());
        }
        Ok(ordered)
    }

    async fn delete_track(&self, release: ReleaseId, track: TrackId) -> RepoResult<()> {
        let mut state = self.state.write();
        state.scoped(release, track)?;
        state.tracks.remove(&track);
        Ok(())
    }
}
