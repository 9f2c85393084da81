//! Release and track slot management. Every route checks that the caller
//! owns the release before touching it.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use gridfire_model::{Release, ReleaseId, Track, TrackId, UserId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AppError, AppResult, AppState, infra::identity::Caller};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReleaseRequest {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddTrackRequest {
    #[serde(default)]
    pub title: Option<String>,
}

/// A release with its ordered track list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    #[serde(flatten)]
    pub release: Release,
    pub track_list: Vec<Track>,
}

async fn release_view(
    state: &AppState,
    user: UserId,
    release: ReleaseId,
) -> AppResult<ReleaseResponse> {
    let release = state.pipeline.authorize(user, release).await?;
    let track_list = state.pipeline.list_tracks(user, release.id).await?;
    Ok(ReleaseResponse {
        release,
        track_list,
    })
}

/// `POST /api/release`
pub async fn create_release(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(request): Json<CreateReleaseRequest>,
) -> AppResult<(StatusCode, Json<Release>)> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("Release title must not be empty"));
    }
    let release = state.pipeline.create_release(user, title).await?;
    info!(user_id = %user, release_id = %release.id, "release created");
    Ok((StatusCode::CREATED, Json(release)))
}

/// `GET /api/release/{release_id}`
pub async fn get_release(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(release_id): Path<ReleaseId>,
) -> AppResult<Json<ReleaseResponse>> {
    Ok(Json(release_view(&state, user, release_id).await?))
}

/// `PUT /api/release/{release_id}/track`: appends an empty `pending` slot.
pub async fn add_track(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(release_id): Path<ReleaseId>,
    request: Option<Json<AddTrackRequest>>,
) -> AppResult<(StatusCode, Json<Track>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let title = request.title.as_deref().map(str::trim).unwrap_or_default();
    let track = state.pipeline.add_track(user, release_id, title).await?;
    Ok((StatusCode::CREATED, Json(track)))
}

/// `DELETE /api/release/{release_id}/track/{track}`
pub async fn delete_track(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((release_id, track_id)): Path<(ReleaseId, TrackId)>,
) -> AppResult<Json<ReleaseResponse>> {
    state
        .pipeline
        .delete_track(user, release_id, track_id)
        .await?;
    Ok(Json(release_view(&state, user, release_id).await?))
}

/// `PATCH /api/release/{release_id}/track/{track}/{to}`: moves the track at
/// position `track` to position `to`.
pub async fn move_track(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((release_id, from, to)): Path<(ReleaseId, usize, usize)>,
) -> AppResult<Json<ReleaseResponse>> {
    let release = state.pipeline.authorize(user, release_id).await?;
    let track_list = state
        .pipeline
        .move_track(user, release_id, from, to)
        .await?;
    Ok(Json(ReleaseResponse {
        release,
        track_list,
    }))
}
