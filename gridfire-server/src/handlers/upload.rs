//! `POST /api/upload/audio`
//!
//! The multipart body carries `releaseId`, `trackId` and optionally
//! `trackName` as text fields, followed by the audio file part. The file is
//! never buffered: chunks are handed to the pipeline as they arrive and
//! written, encrypted, to the source bucket.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{
    Json,
    extract::{Multipart, State, multipart::Field},
    http::{HeaderMap, StatusCode, header::CONTENT_LENGTH},
};
use bytes::Bytes;
use futures::StreamExt;
use gridfire_core::{
    UploadReceipt, UploadRequest,
    storage::{ByteStream, byte_stream},
};
use gridfire_model::{ReleaseId, TrackId, UserId};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{AppError, AppResult, AppState, infra::identity::Caller};

/// Chunks in flight between the request body and the storage write.
const CHUNK_BUFFER: usize = 8;

#[derive(Debug, Default)]
struct UploadFields {
    release_id: Option<ReleaseId>,
    track_id: Option<TrackId>,
    track_name: Option<String>,
}

impl UploadFields {
    fn request(
        &self,
        user_id: UserId,
        mime_type: String,
        size_hint: Option<u64>,
    ) -> AppResult<UploadRequest> {
        let (Some(release_id), Some(track_id)) = (self.release_id, self.track_id) else {
            return Err(AppError::bad_request(
                "releaseId and trackId must be sent before the file part",
            ));
        };
        Ok(UploadRequest {
            user_id,
            release_id,
            track_id,
            track_name: self.track_name.clone(),
            mime_type,
            size_hint,
        })
    }
}

fn parse_id<T: std::str::FromStr>(name: &str, value: &str) -> AppResult<T> {
    value
        .parse()
        .map_err(|_| AppError::bad_request(format!("{name} is not a valid id")))
}

pub async fn upload_audio(
    State(state): State<AppState>,
    Caller(user): Caller,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadReceipt>)> {
    // The whole body length; a slight overestimate of the file itself.
    let size_hint = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let mut fields = UploadFields::default();
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_some() {
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let request = fields.request(user, mime_type, size_hint)?;
            let receipt = ingest(&state, request, field).await?;
            return Ok((StatusCode::CREATED, Json(receipt)));
        }

        let name = field.name().unwrap_or_default().to_string();
        let value = field.text().await?;
        match name.as_str() {
            "releaseId" => fields.release_id = Some(parse_id("releaseId", &value)?),
            "trackId" => fields.track_id = Some(parse_id("trackId", &value)?),
            "trackName" => fields.track_name = Some(value),
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }

    Err(AppError::bad_request("upload is missing the audio file part"))
}

/// Feeds the pipeline from `rx`. Unless `finished` was set before the
/// senders went away, the stream ends with an error instead of a clean end,
/// so a body cut off by a dropped request is never stored as complete.
fn request_body(
    rx: mpsc::Receiver<io::Result<Bytes>>,
    finished: Arc<AtomicBool>,
) -> ByteStream {
    let tail = futures::stream::once(async move {
        (!finished.load(Ordering::Acquire)).then(|| {
            Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "upload body ended before the file part was complete",
            ))
        })
    })
    .filter_map(std::future::ready);
    byte_stream(ReceiverStream::new(rx).chain(tail))
}

/// Runs the pipeline upload in its own task while this one pumps the file
/// part into it. The task outlives a dropped request so the track is still
/// moved to `error`.
async fn ingest(
    state: &AppState,
    request: UploadRequest,
    mut field: Field<'_>,
) -> AppResult<UploadReceipt> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHUNK_BUFFER);
    let finished = Arc::new(AtomicBool::new(false));
    let pipeline = state.pipeline.clone();
    let body = request_body(rx, finished.clone());
    let upload = tokio::spawn(async move { pipeline.upload(request, body).await });

    let mut body_error = None;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                // A closed channel means the pipeline already gave up; its
                // error is the one worth reporting.
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                finished.store(true, Ordering::Release);
                break;
            }
            Err(err) => {
                warn!(error = %err, "upload body interrupted");
                let abort = io::Error::new(io::ErrorKind::ConnectionAborted, err.body_text());
                let _ = tx.send(Err(abort)).await;
                body_error = Some(err);
                break;
            }
        }
    }
    drop(tx);

    let result = upload
        .await
        .map_err(|err| AppError::internal(format!("upload task failed: {err}")))?;
    match (result, body_error) {
        (Err(_), Some(err)) => Err(err.into()),
        (result, _) => result.map_err(AppError::from),
    }
}
