//! Job pipeline controller.
//!
//! [`Pipeline`] owns every collaborator a stage needs and turns one leased
//! job into a [`JobOutcome`]. Stage order per track is enforced by the track
//! state machine, never by queue order, so a job that does not fit the
//! track's current status fails fast instead of running on missing inputs.

mod ingest;
pub mod scratch;
mod stages;
pub mod worker;

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use gridfire_model::{
    Job, JobKind, PipelineEvent, ReleaseId, StageJob, TrackId, TrackStatus, UserId,
};
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    crypto::{CipherKey, KeyStore, decrypt_stream, encrypt_stream},
    error::{ErrorClass, PipelineError, Result},
    notify::Notifier,
    packager::SegmentPackager,
    queue::{JobLease, QueueError, QueueService},
    storage::{Buckets, ObjectStore, TransferProgress, byte_stream, count_bytes, keys},
    tracks::{RepositoryError, TrackRepository},
    transcode::{ProgressReporter, TranscodeEngine},
};

pub use ingest::{UploadReceipt, UploadRequest};
pub use scratch::ScratchSpace;
pub use worker::{WorkerPool, WorkerSettings};

/// Everything the stage handlers share. Built once at process start.
#[derive(Debug, Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn ObjectStore>,
    pub buckets: Buckets,
    pub keys: Arc<dyn KeyStore>,
    pub engine: Arc<dyn TranscodeEngine>,
    pub packager: SegmentPackager,
    pub tracks: Arc<dyn TrackRepository>,
    pub queue: Arc<dyn QueueService>,
    pub notifier: Arc<dyn Notifier>,
    pub scratch: ScratchSpace,
    /// Upper bound for one stage run, including downloads and uploads.
    pub job_timeout: Duration,
}

/// How the worker should resolve a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ack,
    /// Transient failure; hand the job back for another attempt.
    Retry { error: String },
    /// Do not redeliver. The track has already been updated if needed.
    DeadLetter { error: String },
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    deps: Arc<PipelineDeps>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    pub fn queue(&self) -> Arc<dyn QueueService> {
        Arc::clone(&self.deps.queue)
    }

    pub fn tracks(&self) -> Arc<dyn TrackRepository> {
        Arc::clone(&self.deps.tracks)
    }

    /// Runs the stage for `lease` and decides what happens to it.
    pub async fn process(&self, lease: &JobLease) -> JobOutcome {
        let job = &lease.job;
        let params = job.params();
        let span = info_span!(
            "job",
            kind = %job.kind(),
            job_id = %lease.job_id,
            track_id = %params.track_id,
            attempt = lease.attempts,
        );

        let timeout = self.deps.job_timeout;
        let run = async {
            info!("stage started");
            match job {
                Job::EncodeFlac(params) => {
                    self.encode_flac(params, lease.is_redelivery()).await
                }
                Job::TranscodeAac(params) => self.transcode_aac(params).await,
                Job::TranscodeMp3(params) => self.transcode_mp3(params).await,
            }
        };
        let result = match tokio::time::timeout(timeout, run)
            .instrument(span.clone())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                span.in_scope(|| info!("stage finished"));
                JobOutcome::Ack
            }
            Err(err) => self.on_failure(job, err).instrument(span).await,
        }
    }

    async fn on_failure(&self, job: &Job, err: PipelineError) -> JobOutcome {
        let message = err.to_string();
        let params = job.params();

        if track_is_gone(&err) {
            info!(error = %message, "track was removed while the job ran; dropping it");
            if let Err(purge) = self.purge_artifacts(params.release_id, params.track_id).await {
                warn!(error = %purge, "failed to remove artifacts left by the dropped job");
            }
            return JobOutcome::Ack;
        }

        match err.class() {
            ErrorClass::Transient => {
                warn!(error = %message, "stage failed; job will be retried");
                JobOutcome::Retry { error: message }
            }
            ErrorClass::Consistency => {
                error!(
                    error = %message,
                    "job does not fit the track's state; leaving the track untouched"
                );
                JobOutcome::DeadLetter { error: message }
            }
            class => {
                error!(error = %message, ?class, "stage failed permanently");
                self.abandon(job, &message).await;
                JobOutcome::DeadLetter { error: message }
            }
        }
    }

    /// Records a permanent stage failure: the track moves to `error` (the
    /// MP3 stage only reports) and the owner is told.
    pub async fn abandon(&self, job: &Job, message: &str) {
        let params = job.params();
        self.notify(
            params.user_id,
            PipelineEvent::PipelineError {
                track_id: params.track_id,
                stage: job.kind().stage().to_string(),
                message: message.to_string(),
            },
        )
        .await;

        if job.kind() == JobKind::TranscodeMp3 {
            return;
        }
        self.fail_track(params.user_id, params.release_id, params.track_id)
            .await;
    }

    async fn fail_track(&self, user: UserId, release: ReleaseId, track: TrackId) {
        match self.deps.tracks.mark_error(release, track).await {
            Ok(true) => {
                self.notify(user, PipelineEvent::status(track, TrackStatus::Error))
                    .await;
            }
            Ok(false) => debug!(track_id = %track, "track already left a failable state"),
            Err(err) => error!(track_id = %track, error = %err, "failed to record error status"),
        }
    }

    /// Removes every stored artifact of a track from every bucket.
    pub async fn purge_artifacts(&self, release: ReleaseId, track: TrackId) -> Result<usize> {
        let prefix = keys::track_prefix(release, track);
        let mut removed = 0;
        for bucket in self.deps.buckets.all() {
            removed += self.deps.store.delete_objects(bucket, &prefix).await?;
        }
        Ok(removed)
    }

    async fn notify(&self, user: UserId, event: PipelineEvent) {
        self.deps.notifier.send(user, event).await;
    }

    async fn announce(&self, job: &StageJob, status: TrackStatus) {
        self.notify(job.user_id, PipelineEvent::status(job.track_id, status))
            .await;
    }

    /// Drives `work` while forwarding the percentages it reports to the
    /// user, in order, from this task.
    async fn with_progress<F, T>(
        &self,
        user: UserId,
        track: TrackId,
        event: fn(TrackId, u8) -> PipelineEvent,
        work: impl FnOnce(ProgressReporter) -> F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let reporter = ProgressReporter::new(move |percent| {
            let _ = tx.send(percent);
        });
        let work = work(reporter);
        tokio::pin!(work);

        let output = loop {
            tokio::select! {
                biased;
                Some(percent) = rx.recv() => {
                    self.notify(user, event(track, percent)).await;
                }
                output = &mut work => break output,
            }
        };
        while let Ok(percent) = rx.try_recv() {
            self.notify(user, event(track, percent)).await;
        }
        output
    }

    /// Fetches `object` and writes its plaintext to `dest`.
    async fn download_plain(
        &self,
        bucket: &str,
        object: &str,
        key: &CipherKey,
        dest: &Path,
    ) -> Result<u64> {
        let body = self.deps.store.stream_from_bucket(bucket, object).await?;
        let mut reader = StreamReader::new(decrypt_stream(key, body.stream));
        let mut file = tokio::fs::File::create(dest).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        debug!(bucket, object, bytes = written, "downloaded working copy");
        Ok(written)
    }

    /// Streams a local file into the store, encrypting it when `key` is set.
    async fn upload_file(
        &self,
        bucket: &str,
        object: &str,
        path: &Path,
        key: Option<&CipherKey>,
        progress: Option<TransferProgress>,
    ) -> Result<u64> {
        let file = tokio::fs::File::open(path).await?;
        let mut body = byte_stream(ReaderStream::new(file));
        if let Some(progress) = progress {
            body = count_bytes(body, progress);
        }
        if let Some(key) = key {
            body = encrypt_stream(key, body);
        }
        let written = self
            .deps
            .store
            .stream_to_bucket(bucket, object, body, None)
            .await?;
        debug!(bucket, object, bytes = written, "uploaded artifact");
        Ok(written)
    }
}

/// The track was deleted (or is being deleted) underneath the job.
fn track_is_gone(err: &PipelineError) -> bool {
    matches!(
        err,
        PipelineError::Repository(RepositoryError::TrackNotFound(_))
            | PipelineError::Repository(RepositoryError::Conflict {
                status: TrackStatus::Deleting,
                ..
            })
            | PipelineError::Queue(QueueError::TrackCancelled(_))
    )
}
