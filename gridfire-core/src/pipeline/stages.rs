use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use gridfire_model::{
    ArtifactKind, JobDraft, JobKind, PipelineEvent, StageJob, TrackEvent, TrackStatus,
};
use tracing::{debug, info};

use super::Pipeline;
use crate::{
    error::{PipelineError, Result},
    packager::PLAYLIST_FILE,
    storage::{TransferProgress, keys},
    tracks::{RepositoryError, StreamingArtifacts},
    transcode::ProgressReporter,
};

const MP4_FILE: &str = "track.mp4";
const UPLOAD_CONCURRENCY: usize = 4;

impl Pipeline {
    /// `encodeFLAC`: source upload to archival FLAC.
    pub(super) async fn encode_flac(&self, job: &StageJob, redelivered: bool) -> Result<()> {
        let deps = &self.deps;
        let (release, track_id) = (job.release_id, job.track_id);
        let track = deps.tracks.track(release, track_id).await?;

        if track.status.is_past(TrackStatus::Encoding) {
            // A redelivery may have crashed between the status write and
            // publishing the follow-ups.
            if redelivered && track.status == TrackStatus::Encoded {
                if let Some(flac) = track.cid(ArtifactKind::Flac) {
                    self.publish_transcodes(job, flac).await?;
                }
            }
            info!(status = %track.status, "track already encoded; skipping");
            return Ok(());
        }

        deps.tracks
            .transition(release, track_id, TrackEvent::EncodeStarted)
            .await?;
        self.announce(job, TrackStatus::Encoding).await;

        let key = deps.keys.key_for(job.user_id).await?;
        let work = deps.scratch.job_dir("flac").await?;
        let flac_path = work.path().join("archive.flac");

        let source = deps.store.stream_from_bucket(&deps.buckets.src, &job.cid).await?;
        info!(cid = %job.cid, size = ?source.size, "encoding source to flac");
        let input = crate::crypto::decrypt_stream(&key, source.stream);
        self.with_progress(
            job.user_id,
            track_id,
            |track_id, percent| PipelineEvent::EncodingProgressFlac { track_id, percent },
            |progress| deps.engine.encode_flac(input, source.size, &flac_path, progress),
        )
        .await?;

        let archive = keys::archive(release, track_id);
        let size = tokio::fs::metadata(&flac_path).await?.len();
        info!(bytes = size, key = %archive, "storing archival flac");
        self.with_progress(
            job.user_id,
            track_id,
            |track_id, percent| PipelineEvent::StoringProgressFlac { track_id, percent },
            |progress| {
                let counter: TransferProgress =
                    Arc::new(move |bytes| progress.fraction(bytes as f64, size as f64));
                self.upload_file(
                    &deps.buckets.flac,
                    &archive,
                    &flac_path,
                    Some(&key),
                    Some(counter),
                )
            },
        )
        .await?;

        deps.tracks.complete_encode(release, track_id, &archive).await?;
        self.announce(job, TrackStatus::Encoded).await;
        self.publish_transcodes(job, &archive).await
    }

    async fn publish_transcodes(&self, job: &StageJob, flac_cid: &str) -> Result<()> {
        for kind in [JobKind::TranscodeAac, JobKind::TranscodeMp3] {
            let next = JobDraft::follow_up(kind, job).cid(flac_cid).build()?;
            let id = self.deps.queue.publish(next).await?;
            debug!(job_id = %id, kind = %kind, "follow-up published");
        }
        Ok(())
    }

    /// `transcodeAAC`: archival FLAC to a packaged, streamable fMP4.
    pub(super) async fn transcode_aac(&self, job: &StageJob) -> Result<()> {
        let deps = &self.deps;
        let (release, track_id) = (job.release_id, job.track_id);
        let track = deps.tracks.track(release, track_id).await?;
        if track.status == TrackStatus::Stored {
            info!("track already stored; skipping");
            return Ok(());
        }

        deps.tracks
            .transition(release, track_id, TrackEvent::TranscodeStarted)
            .await?;
        self.announce(job, TrackStatus::Transcoding).await;
        self.notify(
            job.user_id,
            PipelineEvent::TranscodingStartedAac { track_id },
        )
        .await;

        let key = deps.keys.key_for(job.user_id).await?;
        let work = deps.scratch.job_dir("aac").await?;
        let source = work.path().join("source.flac");
        let mp4 = work.path().join(MP4_FILE);
        let segments = work.path().join("segments");
        tokio::fs::create_dir(&segments).await?;

        self.download_plain(&deps.buckets.flac, &job.cid, &key, &source)
            .await?;
        let probe = deps.engine.probe(&source).await?;
        info!(duration = probe.duration, codec = %probe.codec, "probed archival flac");

        let progress = ProgressReporter::new(move |percent| {
            debug!(percent, "aac encode progress");
        });
        deps.engine
            .encode_fragmented_aac(&source, &mp4, progress)
            .await?;

        let packaged = deps.packager.package(&mp4, &segments).await?;
        info!(
            segments = packaged.segments.len(),
            duration = packaged.duration,
            "packaged fragmented mp4"
        );

        let mp4_key = keys::distribution(release, track_id, MP4_FILE);
        self.upload_file(&deps.buckets.mp4, &mp4_key, &mp4, None, None)
            .await?;
        // Owned futures keep the stage future `Send` under `tokio::spawn`.
        let uploads: Vec<_> = packaged
            .files
            .iter()
            .map(|file| {
                let object = keys::distribution(release, track_id, &file.name);
                let path = file.path.clone();
                let bucket = deps.buckets.mp4.clone();
                async move {
                    self.upload_file(&bucket, &object, &path, None, None)
                        .await
                }
            })
            .collect();
        futures::stream::iter(uploads)
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        let duration = if probe.duration > 0.0 {
            probe.duration
        } else {
            packaged.duration
        };
        let artifacts = StreamingArtifacts {
            mp4_cid: mp4_key,
            hls_cid: keys::distribution(release, track_id, PLAYLIST_FILE),
            duration,
            init_range: packaged.init_range,
            segment_list: packaged.segments,
            segment_duration: packaged.segment_duration,
            segment_timescale: packaged.timescale,
        };
        match deps
            .tracks
            .complete_transcode(release, track_id, &artifacts)
            .await
        {
            Ok(()) => {}
            // A concurrent delivery of the same job got there first.
            Err(RepositoryError::Conflict {
                status: TrackStatus::Stored,
                ..
            }) => {
                info!("track was stored by another delivery");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.announce(job, TrackStatus::Stored).await;
        self.notify(
            job.user_id,
            PipelineEvent::TranscodingCompleteAac {
                track_id,
                track_name: job.track_name.clone(),
            },
        )
        .await;
        Ok(())
    }

    /// `transcodeMP3`: archival FLAC to an encrypted MP3. Never changes the
    /// track status.
    pub(super) async fn transcode_mp3(&self, job: &StageJob) -> Result<()> {
        let deps = &self.deps;
        let (release, track_id) = (job.release_id, job.track_id);
        let track = deps.tracks.track(release, track_id).await?;

        if track.cid(ArtifactKind::Mp3).is_some() {
            info!("mp3 already recorded; skipping");
            return Ok(());
        }
        let ready = matches!(
            track.status,
            TrackStatus::Encoded
                | TrackStatus::Transcoding
                | TrackStatus::Stored
                | TrackStatus::Error
        );
        if !ready || track.cid(ArtifactKind::Flac).is_none() {
            return Err(PipelineError::consistency(format!(
                "mp3 requested for track {track_id} in status {} without an archival flac",
                track.status
            )));
        }

        self.notify(
            job.user_id,
            PipelineEvent::TranscodingStartedMp3 { track_id },
        )
        .await;

        let key = deps.keys.key_for(job.user_id).await?;
        let work = deps.scratch.job_dir("mp3").await?;
        let source = work.path().join("source.flac");
        let mp3 = work.path().join("track.mp3");

        self.download_plain(&deps.buckets.flac, &job.cid, &key, &source)
            .await?;
        let progress = ProgressReporter::new(move |percent| {
            debug!(percent, "mp3 encode progress");
        });
        deps.engine.encode_mp3(&source, &mp3, progress).await?;

        let mp3_key = keys::archive(release, track_id);
        self.upload_file(&deps.buckets.mp3, &mp3_key, &mp3, Some(&key), None)
            .await?;
        deps.tracks.record_mp3(release, track_id, &mp3_key).await?;
        info!(key = %mp3_key, "mp3 stored");

        self.notify(
            job.user_id,
            PipelineEvent::TranscodingCompleteMp3 {
                track_id,
                track_name: job.track_name.clone(),
            },
        )
        .await;
        Ok(())
    }
}
