use std::time::Duration;

use futures::TryStreamExt;
use gridfire_core::{
    ErrorClass, JobOutcome, UploadRequest,
    crypto::{KeyStore, decrypt_stream},
    queue::{QueueError, QueueService, RetryPolicy},
    storage::{ObjectStore, keys},
    testing::{FakeEngine, FakeFailure, FakeStage, TestPipeline, wav_body},
    tracks::TrackRepository,
};
use gridfire_model::{
    ArtifactKind, Job, JobDraft, JobKind, PipelineEvent, Release, SegmentLookup, Track,
    TrackStatus, UserId,
};

const LEASE: Duration = Duration::from_secs(60);
const WAV_BYTES: usize = 200_000;

async fn slot(h: &TestPipeline, owner: UserId) -> (Release, Track) {
    let release = h.pipeline.create_release(owner, "Night Drive").await.unwrap();
    let track = h.pipeline.add_track(owner, release.id, "T1").await.unwrap();
    (release, track)
}

fn request(owner: UserId, release: &Release, track: &Track, mime: &str) -> UploadRequest {
    UploadRequest {
        user_id: owner,
        release_id: release.id,
        track_id: track.id,
        track_name: Some(track.title.clone()),
        mime_type: mime.to_string(),
        size_hint: Some(WAV_BYTES as u64),
    }
}

async fn upload_wav(h: &TestPipeline, owner: UserId) -> (Release, Track) {
    let (release, track) = slot(h, owner).await;
    h.pipeline
        .upload(request(owner, &release, &track, "audio/wav"), wav_body(WAV_BYTES))
        .await
        .unwrap();
    (release, track)
}

async fn current(h: &TestPipeline, release: &Release, track: &Track) -> Track {
    h.tracks.track(release.id, track.id).await.unwrap()
}

async fn plaintext(h: &TestPipeline, owner: UserId, bucket: &str, key: &str) -> Vec<u8> {
    let body = h.store.stream_from_bucket(bucket, key).await.unwrap();
    let key = h.keys.key_for(owner).await.unwrap();
    decrypt_stream(&key, body.stream)
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn wav_upload_flows_through_every_stage() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    let uploaded = current(&h, &release, &track).await;
    assert_eq!(uploaded.status, TrackStatus::Uploaded);
    assert_eq!(
        uploaded.cid(ArtifactKind::Src),
        Some(keys::source(release.id, track.id, ".wav").as_str())
    );
    let queued = h.queue.pending_jobs();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), JobKind::EncodeFlac);

    let outcome = h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Ack));
    let encoded = current(&h, &release, &track).await;
    assert_eq!(encoded.status, TrackStatus::Encoded);
    assert_eq!(
        encoded.cid(ArtifactKind::Flac),
        Some(keys::archive(release.id, track.id).as_str())
    );
    let kinds: Vec<JobKind> = h.queue.pending_jobs().iter().map(Job::kind).collect();
    assert_eq!(kinds, vec![JobKind::TranscodeAac, JobKind::TranscodeMp3]);

    assert_eq!(h.pipeline.drain("test-worker").await.unwrap(), 2);

    let stored = current(&h, &release, &track).await;
    assert_eq!(stored.status, TrackStatus::Stored);
    assert!(stored.is_consistent());
    assert!((stored.duration.unwrap() - 180.0).abs() < 0.5);
    assert_eq!(
        stored.cid(ArtifactKind::Mp4),
        Some(keys::distribution(release.id, track.id, "track.mp4").as_str())
    );
    assert_eq!(
        stored.cid(ArtifactKind::Hls),
        Some(keys::distribution(release.id, track.id, "playlist.m3u8").as_str())
    );
    assert_eq!(stored.segment_list.len(), 18);
    assert!(stored.init_range.is_some());
    assert_eq!(
        stored.cid(ArtifactKind::Mp3),
        Some(keys::archive(release.id, track.id).as_str())
    );

    assert_eq!(
        h.notifier.statuses(track.id),
        vec![
            TrackStatus::Uploading,
            TrackStatus::Uploaded,
            TrackStatus::Encoding,
            TrackStatus::Encoded,
            TrackStatus::Transcoding,
            TrackStatus::Stored,
        ]
    );
    let names = h.notifier.names(track.id);
    for expected in [
        "uploadProgress",
        "encodingProgressFLAC",
        "storingProgressFLAC",
        "transcodingStartedAAC",
        "transcodingCompleteAAC",
        "transcodingStartedMP3",
        "transcodingCompleteMP3",
    ] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
    assert!(h.notifier.events().iter().all(|(user, _)| *user == owner));
}

#[tokio::test]
async fn archival_copies_are_encrypted_and_distribution_files_are_not() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    h.pipeline.drain("test-worker").await.unwrap();

    let archive = keys::archive(release.id, track.id);
    let flac = plaintext(&h, owner, &h.buckets.flac, &archive).await;
    assert!(flac.starts_with(b"fLaCRIFF"));
    let mp3 = plaintext(&h, owner, &h.buckets.mp3, &archive).await;
    assert!(mp3.starts_with(b"ID3fLaC"));

    let raw = h
        .store
        .stream_from_bucket(&h.buckets.flac, &archive)
        .await
        .unwrap()
        .stream
        .map_ok(|chunk| chunk.to_vec())
        .try_concat()
        .await
        .unwrap();
    assert!(!raw.windows(4).any(|w| w == b"RIFF"));

    let mp4 = h
        .store
        .stream_from_bucket(
            &h.buckets.mp4,
            &keys::distribution(release.id, track.id, "track.mp4"),
        )
        .await
        .unwrap()
        .stream
        .map_ok(|chunk| chunk.to_vec())
        .try_concat()
        .await
        .unwrap();
    assert_eq!(&mp4[4..8], b"ftyp");
    let listing = h
        .store
        .list_objects(&h.buckets.mp4, &keys::track_prefix(release.id, track.id))
        .await
        .unwrap();
    // track.mp4, init.mp4, 18 segments and the playlist
    assert_eq!(listing.len(), 21);
}

#[tokio::test]
async fn segment_lookup_resolves_playback_time() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (_, track) = upload_wav(&h, owner).await;
    h.pipeline.drain("test-worker").await.unwrap();

    let (info, hit) = h
        .pipeline
        .locate_segment(track.id, 47.0, SegmentLookup::Backward)
        .await
        .unwrap();
    assert_eq!(info.segment_seconds(), 10.0);
    assert_eq!(hit.index, 4);
    assert!(!hit.end);

    let (_, last) = h
        .pipeline
        .locate_segment(track.id, 179.0, SegmentLookup::Forward)
        .await
        .unwrap();
    assert_eq!(last.index, 17);
    assert!(last.end);
}

#[tokio::test]
async fn duplicate_encode_delivery_changes_nothing() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    let original = h.queue.pending_jobs().remove(0);

    h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    let archive = keys::archive(release.id, track.id);
    let first = plaintext(&h, owner, &h.buckets.flac, &archive).await;

    h.queue.publish(original).await.unwrap();
    h.pipeline.drain("test-worker").await.unwrap();

    assert_eq!(h.engine.calls(FakeStage::Flac), 1);
    assert_eq!(h.engine.calls(FakeStage::Aac), 1);
    assert_eq!(h.engine.calls(FakeStage::Mp3), 1);
    assert_eq!(plaintext(&h, owner, &h.buckets.flac, &archive).await, first);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Stored);
}

#[tokio::test]
async fn transient_failures_retry_and_then_succeed() {
    let h = TestPipeline::new().unwrap();
    h.engine.fail(FakeStage::Flac, FakeFailure::Transient, 1);
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    let outcome = h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Retry { .. })));
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Encoding);

    h.pipeline.drain("test-worker").await.unwrap();
    assert_eq!(h.engine.calls(FakeStage::Flac), 2);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Stored);
    // One follow-up of each kind, despite the retry.
    assert_eq!(h.engine.calls(FakeStage::Aac), 1);
    assert_eq!(h.engine.calls(FakeStage::Mp3), 1);
}

#[tokio::test]
async fn exhausted_retries_mark_the_track_failed() {
    let h = TestPipeline::build(FakeEngine::default(), RetryPolicy::immediate(3)).unwrap();
    h.engine.fail(FakeStage::Flac, FakeFailure::Transient, 10);
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    assert_eq!(h.pipeline.drain("test-worker").await.unwrap(), 3);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Error);
    assert_eq!(h.queue.dead_letters().len(), 1);
    assert!(h.notifier.names(track.id).contains(&"pipelineError"));
}

#[tokio::test]
async fn corrupt_audio_fails_the_track_without_retrying() {
    let h = TestPipeline::new().unwrap();
    h.engine.fail(FakeStage::Flac, FakeFailure::Content, 1);
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    let outcome = h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::DeadLetter { .. })));
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Error);
    assert_eq!(h.engine.calls(FakeStage::Flac), 1);
    assert!(h.queue.pending_jobs().is_empty());

    let failure = h
        .notifier
        .events_for(track.id)
        .into_iter()
        .find_map(|event| match event {
            PipelineEvent::PipelineError { stage, .. } => Some(stage),
            _ => None,
        });
    assert_eq!(failure.as_deref(), Some("flac"));
    assert_eq!(h.notifier.statuses(track.id).last(), Some(&TrackStatus::Error));
}

#[tokio::test]
async fn failed_track_can_be_uploaded_again() {
    let h = TestPipeline::new().unwrap();
    h.engine.fail(FakeStage::Flac, FakeFailure::Content, 1);
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    h.pipeline.drain("test-worker").await.unwrap();
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Error);

    h.pipeline
        .upload(request(owner, &release, &track, "audio/flac"), wav_body(WAV_BYTES))
        .await
        .unwrap();
    h.pipeline.drain("test-worker").await.unwrap();
    let stored = current(&h, &release, &track).await;
    assert_eq!(stored.status, TrackStatus::Stored);
    assert_eq!(
        stored.cid(ArtifactKind::Src),
        Some(keys::source(release.id, track.id, ".flac").as_str())
    );
}

#[tokio::test]
async fn transcode_before_encode_is_dead_lettered_without_state_change() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = slot(&h, owner).await;
    let src = keys::source(release.id, track.id, ".wav");
    h.tracks.begin_upload(release.id, track.id).await.unwrap();
    h.tracks.complete_upload(release.id, track.id, &src).await.unwrap();

    let early = JobDraft::new(JobKind::TranscodeAac)
        .user(owner)
        .release(release.id)
        .track(track.id)
        .cid(keys::archive(release.id, track.id))
        .build()
        .unwrap();
    h.queue.publish(early).await.unwrap();

    let outcome = h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::DeadLetter { .. })));
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Uploaded);
    assert_eq!(h.engine.calls(FakeStage::Aac), 0);
    assert_eq!(h.queue.dead_letters().len(), 1);
    assert!(h.notifier.events_for(track.id).is_empty());
}

#[tokio::test]
async fn mp3_failure_does_not_touch_the_track_status() {
    let h = TestPipeline::new().unwrap();
    h.engine.fail(FakeStage::Mp3, FakeFailure::Content, 1);
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    h.pipeline.drain("test-worker").await.unwrap();

    let stored = current(&h, &release, &track).await;
    assert_eq!(stored.status, TrackStatus::Stored);
    assert_eq!(stored.cid(ArtifactKind::Mp3), None);
    assert!(!h.notifier.statuses(track.id).contains(&TrackStatus::Error));
    let failed_stage = h
        .notifier
        .events_for(track.id)
        .into_iter()
        .find_map(|event| match event {
            PipelineEvent::PipelineError { stage, .. } => Some(stage),
            _ => None,
        });
    assert_eq!(failed_stage.as_deref(), Some("mp3"));
}

#[tokio::test]
async fn lossy_uploads_are_rejected_before_any_write() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = slot(&h, owner).await;

    let err = h
        .pipeline
        .upload(request(owner, &release, &track, "audio/mpeg"), wav_body(WAV_BYTES))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Pending);
    assert!(h.store.list_objects(&h.buckets.src, "").await.unwrap().is_empty());
    assert!(h.queue.pending_jobs().is_empty());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn only_the_release_owner_may_upload() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = slot(&h, owner).await;

    let err = h
        .pipeline
        .upload(
            request(UserId::new(), &release, &track, "audio/wav"),
            wav_body(WAV_BYTES),
        )
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Forbidden);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Pending);
}

#[tokio::test]
async fn scratch_space_is_empty_after_success_and_failure() {
    let h = TestPipeline::new().unwrap();
    h.engine.fail(FakeStage::Probe, FakeFailure::Content, 1);
    let owner = UserId::new();
    let (release, first) = upload_wav(&h, owner).await;
    let second = h.pipeline.add_track(owner, release.id, "T2").await.unwrap();
    h.pipeline
        .upload(request(owner, &release, &second, "audio/wav"), wav_body(WAV_BYTES))
        .await
        .unwrap();

    h.pipeline.drain("test-worker").await.unwrap();
    assert_eq!(current(&h, &release, &first).await.status, TrackStatus::Error);
    assert_eq!(current(&h, &release, &second).await.status, TrackStatus::Stored);
    assert!(h.scratch.entries().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_track_removes_artifacts_and_stops_jobs() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    h.pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert_eq!(h.queue.pending_jobs().len(), 2);

    let removed = h
        .pipeline
        .delete_track(owner, release.id, track.id)
        .await
        .unwrap();
    assert_eq!(removed, 2); // source and archival flac

    assert!(h.queue.pending_jobs().is_empty());
    assert!(h.tracks.track(release.id, track.id).await.is_err());
    let prefix = keys::track_prefix(release.id, track.id);
    for bucket in h.buckets.all() {
        assert!(h.store.list_objects(bucket, &prefix).await.unwrap().is_empty());
    }

    let late = JobDraft::new(JobKind::TranscodeMp3)
        .user(owner)
        .release(release.id)
        .track(track.id)
        .cid(keys::archive(release.id, track.id))
        .build()
        .unwrap();
    assert!(matches!(
        h.queue.publish(late).await,
        Err(QueueError::TrackCancelled(_))
    ));
}

#[tokio::test]
async fn in_flight_job_for_a_deleted_track_is_dropped_quietly() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;
    let lease = h.queue.reserve("test-worker", LEASE).await.unwrap().unwrap();

    h.pipeline
        .delete_track(owner, release.id, track.id)
        .await
        .unwrap();

    assert_eq!(h.pipeline.process(&lease).await, JobOutcome::Ack);
    h.queue.ack(lease.lease_id).await.unwrap();
    assert!(h.queue.dead_letters().is_empty());
    assert_eq!(h.engine.calls(FakeStage::Flac), 0);
    let prefix = keys::track_prefix(release.id, track.id);
    for bucket in h.buckets.all() {
        assert!(h.store.list_objects(bucket, &prefix).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn track_slots_can_be_reordered() {
    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, first) = slot(&h, owner).await;
    let second = h.pipeline.add_track(owner, release.id, "T2").await.unwrap();
    let third = h.pipeline.add_track(owner, release.id, "T3").await.unwrap();

    let order = h.pipeline.move_track(owner, release.id, 2, 0).await.unwrap();
    let ids: Vec<_> = order.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![third.id, first.id, second.id]);
    let positions: Vec<_> = order.iter().map(|t| t.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);

    let err = h
        .pipeline
        .move_track(UserId::new(), release.id, 0, 1)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Forbidden);
}

#[tokio::test]
async fn encode_redelivered_mid_run_writes_the_same_archive() {
    let reference = TestPipeline::new().unwrap();
    let reference_owner = UserId::new();
    let (reference_release, reference_track) = upload_wav(&reference, reference_owner).await;
    reference.pipeline.drain("test-worker").await.unwrap();
    let expected = plaintext(
        &reference,
        reference_owner,
        &reference.buckets.flac,
        &keys::archive(reference_release.id, reference_track.id),
    )
    .await;

    let h = TestPipeline::new().unwrap();
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    // The first worker's lease lapses while it is still encoding.
    let stalled = h.queue.reserve("stalled-worker", Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(h.queue.requeue_expired().await.unwrap(), 1);
    let redelivered = h.queue.reserve("test-worker", LEASE).await.unwrap().unwrap();
    assert!(redelivered.is_redelivery());

    let (first, second) = tokio::join!(
        h.pipeline.process(&stalled),
        h.pipeline.process(&redelivered)
    );
    assert_eq!(h.engine.calls(FakeStage::Flac), 2);
    assert!(
        first == JobOutcome::Ack || second == JobOutcome::Ack,
        "outcomes: {first:?} {second:?}"
    );
    h.queue.ack(redelivered.lease_id).await.unwrap();
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Encoded);

    let archive = keys::archive(release.id, track.id);
    assert_eq!(plaintext(&h, owner, &h.buckets.flac, &archive).await, expected);

    h.pipeline.drain("test-worker").await.unwrap();
    assert_eq!(h.engine.calls(FakeStage::Aac), 1);
    assert_eq!(h.engine.calls(FakeStage::Mp3), 1);
    assert_eq!(plaintext(&h, owner, &h.buckets.flac, &archive).await, expected);
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Stored);
}

#[cfg(unix)]
#[tokio::test]
async fn stuck_encoder_is_killed_and_the_track_fails() {
    use std::{os::unix::fs::PermissionsExt, sync::Arc, time::Instant};

    use gridfire_core::{
        Pipeline, PipelineDeps,
        transcode::{FfmpegEngine, FfmpegSettings},
    };

    let bin = tempfile::tempdir().unwrap();
    let hung = bin.path().join("ffmpeg");
    std::fs::write(&hung, "#!/bin/sh\ncat > /dev/null\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&hung, std::fs::Permissions::from_mode(0o755)).unwrap();

    let h = TestPipeline::new().unwrap();
    let engine = FfmpegEngine::new(FfmpegSettings {
        ffmpeg_path: hung.clone(),
        ffprobe_path: hung,
        timeout: Duration::from_millis(500),
        ..FfmpegSettings::default()
    });
    let pipeline = Pipeline::new(PipelineDeps {
        engine: Arc::new(engine),
        ..h.pipeline.deps().clone()
    });
    let owner = UserId::new();
    let (release, track) = upload_wav(&h, owner).await;

    let started = Instant::now();
    let outcome = pipeline.run_next("test-worker", LEASE).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(
        matches!(outcome, Some(JobOutcome::DeadLetter { .. })),
        "outcome: {outcome:?}"
    );
    assert_eq!(current(&h, &release, &track).await.status, TrackStatus::Error);
    assert_eq!(h.queue.dead_letters().len(), 1);
    assert!(h.scratch.entries().unwrap().is_empty());
    assert!(h.notifier.names(track.id).contains(&"pipelineError"));
}
