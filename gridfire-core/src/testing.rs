//! In-process doubles for exercising the pipeline without ffmpeg, Postgres
//! or an object store service.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use gridfire_model::{PipelineEvent, TrackId, TrackStatus, UserId};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::{
    crypto::MemoryKeyStore,
    notify::Notifier,
    packager::{SegmentPackager, fixtures::FragmentedMp4},
    pipeline::{Pipeline, PipelineDeps, ScratchSpace},
    queue::{MemoryQueue, RetryPolicy},
    storage::{Buckets, ByteStream, FsObjectStore, byte_stream},
    tracks::MemoryTrackRepository,
    transcode::{ProbeInfo, ProgressReporter, TranscodeEngine, TranscodeError},
};

const TIMESCALE: u32 = 48_000;
const FRAGMENT_SECONDS: u32 = 2;

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeStage {
    Flac,
    Aac,
    Mp3,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// Classified as a content error, as a non-zero encoder exit would be.
    Content,
    /// Classified as transient, as a failed process spawn would be.
    Transient,
}

impl FakeFailure {
    fn error(self, stage: FakeStage) -> TranscodeError {
        match self {
            FakeFailure::Content => TranscodeError::Exit {
                program: format!("fake-{stage:?}").to_lowercase(),
                code: Some(1),
                stderr: "Invalid data found when processing input".to_string(),
            },
            FakeFailure::Transient => TranscodeError::Spawn {
                program: format!("fake-{stage:?}").to_lowercase(),
                source: std::io::Error::new(std::io::ErrorKind::Interrupted, "spawn interrupted"),
            },
        }
    }
}

/// Deterministic stand-in for ffmpeg.
///
/// FLAC and MP3 outputs are a fixed marker followed by the input bytes, so
/// repeated runs produce identical artifacts. The AAC output is a synthetic
/// fragmented MP4 of the configured duration.
#[derive(Debug)]
pub struct FakeEngine {
    duration_secs: u32,
    failures: Mutex<HashMap<FakeStage, (FakeFailure, usize)>>,
    calls: Mutex<HashMap<FakeStage, usize>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new(180)
    }
}

impl FakeEngine {
    pub fn new(duration_secs: u32) -> Self {
        Self {
            duration_secs: duration_secs.max(FRAGMENT_SECONDS),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the next `times` calls of `stage` fail.
    pub fn fail(&self, stage: FakeStage, failure: FakeFailure, times: usize) {
        self.failures.lock().insert(stage, (failure, times));
    }

    pub fn calls(&self, stage: FakeStage) -> usize {
        self.calls.lock().get(&stage).copied().unwrap_or(0)
    }

    pub fn fixture(&self) -> FragmentedMp4 {
        FragmentedMp4::new(
            TIMESCALE,
            TIMESCALE * FRAGMENT_SECONDS,
            (self.duration_secs / FRAGMENT_SECONDS) as usize,
        )
    }

    fn enter(&self, stage: FakeStage) -> Result<(), TranscodeError> {
        *self.calls.lock().entry(stage).or_default() += 1;
        let mut failures = self.failures.lock();
        if let Some((failure, remaining)) = failures.get_mut(&stage) {
            let failure = *failure;
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(&stage);
            }
            return Err(failure.error(stage));
        }
        Ok(())
    }

    async fn tag_copy(
        marker: &[u8],
        input: &Path,
        output: &Path,
        progress: &ProgressReporter,
    ) -> Result<(), TranscodeError> {
        let body = tokio::fs::read(input).await?;
        let mut out = marker.to_vec();
        out.extend_from_slice(&body);
        tokio::fs::write(output, out).await?;
        progress.percent(100.0);
        Ok(())
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    async fn encode_flac(
        &self,
        mut input: ByteStream,
        size_hint: Option<u64>,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        self.enter(FakeStage::Flac)?;
        let mut file = tokio::fs::File::create(output).await?;
        file.write_all(b"fLaC").await?;
        let mut read = 0u64;
        while let Some(chunk) = input.next().await {
            let chunk = chunk.map_err(TranscodeError::Input)?;
            read += chunk.len() as u64;
            file.write_all(&chunk).await?;
            if let Some(total) = size_hint {
                progress.fraction(read as f64, total as f64);
            }
        }
        file.sync_all().await?;
        progress.percent(100.0);
        Ok(())
    }

    async fn encode_fragmented_aac(
        &self,
        _input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        self.enter(FakeStage::Aac)?;
        tokio::fs::write(output, self.fixture().build()).await?;
        progress.percent(100.0);
        Ok(())
    }

    async fn encode_mp3(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressReporter,
    ) -> Result<(), TranscodeError> {
        self.enter(FakeStage::Mp3)?;
        Self::tag_copy(b"ID3", input, output, &progress).await
    }

    async fn probe(&self, _input: &Path) -> Result<ProbeInfo, TranscodeError> {
        self.enter(FakeStage::Probe)?;
        Ok(ProbeInfo {
            duration: f64::from(self.duration_secs),
            codec: "flac".to_string(),
            sample_rate: Some(44_100),
            channels: Some(2),
            bit_rate: Some(1_411_000),
            format: Some("flac".to_string()),
        })
    }
}

/// Keeps every notification for later assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, PipelineEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(UserId, PipelineEvent)> {
        self.sent.lock().clone()
    }

    pub fn events_for(&self, track: TrackId) -> Vec<PipelineEvent> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, event)| event.track_id() == track)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// `trackStatus` values announced for `track`, in order.
    pub fn statuses(&self, track: TrackId) -> Vec<TrackStatus> {
        self.events_for(track)
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::TrackStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn names(&self, track: TrackId) -> Vec<&'static str> {
        self.events_for(track).iter().map(PipelineEvent::name).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user: UserId, event: PipelineEvent) {
        self.sent.lock().push((user, event));
    }
}

/// A fully wired pipeline over in-memory backends and a temporary
/// filesystem object store.
#[derive(Debug)]
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub store: Arc<FsObjectStore>,
    pub buckets: Buckets,
    pub tracks: Arc<MemoryTrackRepository>,
    pub queue: Arc<MemoryQueue>,
    pub keys: Arc<MemoryKeyStore>,
    pub engine: Arc<FakeEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub scratch: ScratchSpace,
    _dir: TempDir,
}

impl TestPipeline {
    pub fn new() -> std::io::Result<Self> {
        Self::with_engine(FakeEngine::default())
    }

    pub fn with_engine(engine: FakeEngine) -> std::io::Result<Self> {
        Self::build(engine, RetryPolicy::immediate(3))
    }

    pub fn build(engine: FakeEngine, policy: RetryPolicy) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let scratch = ScratchSpace::new(dir.path().join("scratch"));
        let tracks = Arc::new(MemoryTrackRepository::new());
        let queue = Arc::new(MemoryQueue::new(policy));
        let keys = Arc::new(MemoryKeyStore::new());
        let engine = Arc::new(engine);
        let notifier = Arc::new(RecordingNotifier::default());
        let buckets = Buckets::default();

        let pipeline = Pipeline::new(PipelineDeps {
            store: store.clone(),
            buckets: buckets.clone(),
            keys: keys.clone(),
            engine: engine.clone(),
            packager: SegmentPackager::new(10),
            tracks: tracks.clone(),
            queue: queue.clone(),
            notifier: notifier.clone(),
            scratch: scratch.clone(),
            job_timeout: Duration::from_secs(30),
        });

        Ok(Self {
            pipeline,
            store,
            buckets,
            tracks,
            queue,
            keys,
            engine,
            notifier,
            scratch,
            _dir: dir,
        })
    }
}

/// A fake WAV body of `len` bytes, delivered in 8 KiB chunks.
pub fn wav_body(len: usize) -> ByteStream {
    let mut data = b"RIFF".to_vec();
    data.extend((0..len.saturating_sub(4)).map(|i| (i % 251) as u8));
    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(8 * 1024)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    byte_stream(stream::iter(chunks))
}
