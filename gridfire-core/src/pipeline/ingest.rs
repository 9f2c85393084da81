//! Caller-facing operations: uploads and track slot management.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use gridfire_model::{
    JobDraft, JobId, JobKind, PipelineEvent, Release, ReleaseId, SegmentLookup,
    SegmentResolution, SourceFormat, Track, TrackEvent, TrackId, TrackStatus,
    TrackStreamInfo, UserId,
};
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};

use super::Pipeline;
use crate::{
    crypto::encrypt_stream,
    error::{PipelineError, Result},
    storage::{ByteStream, TransferProgress, count_bytes, keys},
    tracks::RepositoryError,
};

/// Metadata accompanying an upload body.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: UserId,
    pub release_id: ReleaseId,
    pub track_id: TrackId,
    pub track_name: Option<String>,
    pub mime_type: String,
    /// Body length in bytes when the client declared it.
    pub size_hint: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub track_id: TrackId,
    pub cid: String,
    /// Plaintext bytes received.
    pub bytes: u64,
    pub job_id: JobId,
}

impl Pipeline {
    /// Loads `release` and checks that `user` owns it.
    pub async fn authorize(&self, user: UserId, release: ReleaseId) -> Result<Release> {
        let found = self.deps.tracks.release(release).await?;
        if found.owner != user {
            return Err(PipelineError::Forbidden(format!(
                "release {release} does not belong to the caller"
            )));
        }
        Ok(found)
    }

    pub async fn create_release(&self, owner: UserId, title: &str) -> Result<Release> {
        Ok(self.deps.tracks.create_release(owner, title).await?)
    }

    /// Adds an empty `pending` track slot to the caller's release.
    pub async fn add_track(
        &self,
        user: UserId,
        release: ReleaseId,
        title: &str,
    ) -> Result<Track> {
        self.authorize(user, release).await?;
        let track = self.deps.tracks.add_track(release, title).await?;
        info!(release_id = %release, track_id = %track.id, "track slot added");
        Ok(track)
    }

    pub async fn list_tracks(&self, user: UserId, release: ReleaseId) -> Result<Vec<Track>> {
        self.authorize(user, release).await?;
        Ok(self.deps.tracks.list_tracks(release).await?)
    }

    /// Reorders the release's tracks, moving the one at `from` to `to`.
    pub async fn move_track(
        &self,
        user: UserId,
        release: ReleaseId,
        from: usize,
        to: usize,
    ) -> Result<Vec<Track>> {
        self.authorize(user, release).await?;
        Ok(self.deps.tracks.move_track(release, from, to).await?)
    }

    /// Streams a lossless source into the `src` bucket, encrypted under the
    /// owner's key, then queues the FLAC encode.
    ///
    /// The MIME type and ownership are checked before anything is written.
    pub async fn upload(&self, request: UploadRequest, body: ByteStream) -> Result<UploadReceipt> {
        let format = SourceFormat::from_mime(&request.mime_type)?;
        self.authorize(request.user_id, request.release_id).await?;

        let span = info_span!(
            "upload",
            release_id = %request.release_id,
            track_id = %request.track_id,
            format = ?format,
        );
        let (release, track) = (request.release_id, request.track_id);
        self.deps
            .tracks
            .begin_upload(release, track)
            .instrument(span.clone())
            .await?;

        match self.receive(&request, format, body).instrument(span.clone()).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                span.in_scope(|| warn!(error = %err, "upload failed"));
                self.notify(
                    request.user_id,
                    PipelineEvent::PipelineError {
                        track_id: track,
                        stage: "upload".to_string(),
                        message: err.to_string(),
                    },
                )
                .await;
                self.fail_track(request.user_id, release, track).await;
                Err(err)
            }
        }
    }

    async fn receive(
        &self,
        request: &UploadRequest,
        format: SourceFormat,
        body: ByteStream,
    ) -> Result<UploadReceipt> {
        let deps = &self.deps;
        let (user, release, track) = (request.user_id, request.release_id, request.track_id);
        self.notify(user, PipelineEvent::status(track, TrackStatus::Uploading))
            .await;

        let key = deps.keys.key_for(user).await?;
        let cid = keys::source(release, track, format.extension());
        info!(cid = %cid, size = ?request.size_hint, "receiving source upload");

        let size = request.size_hint;
        let object = cid.as_str();
        let received = Arc::new(AtomicU64::new(0));
        let stored = self
            .with_progress(
                user,
                track,
                |track_id, percent| PipelineEvent::UploadProgress { track_id, percent },
                |progress| {
                    let counter: TransferProgress = {
                        let progress = progress.clone();
                        let received = received.clone();
                        Arc::new(move |done| {
                            received.store(done, Ordering::Relaxed);
                            if let Some(total) = size {
                                progress.fraction(done as f64, total as f64);
                            }
                        })
                    };
                    let body = encrypt_stream(&key, count_bytes(body, counter));
                    async move {
                        let written = deps
                            .store
                            .stream_to_bucket(&deps.buckets.src, object, body, None)
                            .await?;
                        progress.percent(100.0);
                        Ok::<_, PipelineError>(written)
                    }
                },
            )
            .await?;
        let bytes = received.load(Ordering::Relaxed);
        debug!(bytes, stored, "source encrypted and stored");

        deps.tracks.complete_upload(release, track, &cid).await?;
        self.notify(user, PipelineEvent::status(track, TrackStatus::Uploaded))
            .await;

        let job = JobDraft::new(JobKind::EncodeFlac)
            .user(user)
            .release(release)
            .track(track)
            .track_name(request.track_name.clone())
            .cid(cid.clone())
            .build()?;
        let job_id = deps.queue.publish(job).await?;
        info!(job_id = %job_id, "source stored; flac encode queued");

        Ok(UploadReceipt {
            track_id: track,
            cid,
            bytes,
            job_id,
        })
    }

    /// Removes a track: stops its jobs, deletes every stored artifact, then
    /// drops the record. Returns how many objects were deleted.
    pub async fn delete_track(
        &self,
        user: UserId,
        release: ReleaseId,
        track: TrackId,
    ) -> Result<usize> {
        self.authorize(user, release).await?;
        let deps = &self.deps;

        match deps
            .tracks
            .transition(release, track, TrackEvent::DeleteRequested)
            .await
        {
            Ok(_) => {}
            // An earlier delete got this far and then failed.
            Err(RepositoryError::Conflict {
                status: TrackStatus::Deleting,
                ..
            }) => {}
            Err(err) => return Err(err.into()),
        }
        self.notify(user, PipelineEvent::status(track, TrackStatus::Deleting))
            .await;

        let dropped = deps.queue.cancel_track(track).await?;
        let removed = self.purge_artifacts(release, track).await?;
        deps.tracks.delete_track(release, track).await?;
        info!(
            release_id = %release,
            track_id = %track,
            dropped_jobs = dropped,
            removed_objects = removed,
            "track deleted"
        );
        Ok(removed)
    }

    /// Streaming projection for the player's init request.
    pub async fn stream_info(&self, track: TrackId) -> Result<TrackStreamInfo> {
        Ok(self.deps.tracks.stream_info(track).await?)
    }

    /// Resolves a playback time to a segment of a packaged track.
    pub async fn locate_segment(
        &self,
        track: TrackId,
        time: f64,
        lookup: SegmentLookup,
    ) -> Result<(TrackStreamInfo, SegmentResolution)> {
        let info = self.stream_info(track).await?;
        let resolution = info.resolve(time, lookup)?;
        Ok((info, resolution))
    }
}
