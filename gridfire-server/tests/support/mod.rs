#![allow(dead_code)]

use std::sync::Arc;

use axum_test::{
    TestServer,
    multipart::{MultipartForm, Part},
};
use gridfire_core::{notify::NotificationHub, testing::TestPipeline};
use gridfire_model::{Release, ReleaseId, TrackId, UserId};
pub use gridfire_server::infra::identity::USER_ID_HEADER;
use gridfire_server::{AppState, routes};

pub const MIB: u64 = 1024 * 1024;

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub harness: TestPipeline,
}

impl TestApp {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_upload_limit(16 * MIB)
    }

    pub fn with_upload_limit(max_upload_bytes: u64) -> anyhow::Result<Self> {
        let harness = TestPipeline::new()?;
        let state = AppState::new(
            harness.pipeline.clone(),
            Arc::new(NotificationHub::default()),
            max_upload_bytes,
        );
        state.readiness.mark_ready();
        let server = TestServer::new(routes::create_router(state.clone()))
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        Ok(Self {
            server,
            state,
            harness,
        })
    }

    pub async fn release(&self, owner: UserId) -> Release {
        self.harness
            .pipeline
            .create_release(owner, "Night Drive")
            .await
            .expect("release created")
    }
}

/// `len` bytes of something that starts like a WAV file.
pub fn wav_bytes(len: usize) -> Vec<u8> {
    let mut data = b"RIFF".to_vec();
    data.extend((0..len.saturating_sub(4)).map(|i| (i % 251) as u8));
    data
}

pub fn upload_form(
    release: ReleaseId,
    track: TrackId,
    mime: &str,
    body: Vec<u8>,
) -> MultipartForm {
    MultipartForm::new()
        .add_text("releaseId", release.to_string())
        .add_text("trackId", track.to_string())
        .add_text("trackName", "Intro")
        .add_part(
            "audio",
            Part::bytes(body).file_name("intro.wav").mime_type(mime),
        )
}
