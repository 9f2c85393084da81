//! Read-only lookups for the media player. Only packaged tracks resolve;
//! anything else is a 404 or 409.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use gridfire_model::{ByteRange, SegmentLookup, TrackId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AppResult, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub duration: f64,
    pub cid: String,
    pub range: ByteRange,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentQuery {
    pub time: f64,
    /// `0`/`initial`, `1`/`forward` or `2`/`backward`. Seeks when absent.
    #[serde(rename = "type", default)]
    pub lookup: Option<SegmentLookup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentResponse {
    pub cid: String,
    pub range: ByteRange,
    pub end: bool,
}

/// `GET /api/track/{track_id}/init`
pub async fn track_init(
    State(state): State<AppState>,
    Path(track_id): Path<TrackId>,
) -> AppResult<Json<InitResponse>> {
    let info = state.pipeline.stream_info(track_id).await?;
    Ok(Json(InitResponse {
        duration: info.duration,
        cid: info.cid,
        range: info.init_range,
    }))
}

/// `GET /api/track/{track_id}/stream?time=&type=`
pub async fn track_segment(
    State(state): State<AppState>,
    Path(track_id): Path<TrackId>,
    query: Result<Query<SegmentQuery>, QueryRejection>,
) -> AppResult<Json<SegmentResponse>> {
    let Query(query) = query?;
    let lookup = query.lookup.unwrap_or(SegmentLookup::Backward);
    let (info, segment) = state
        .pipeline
        .locate_segment(track_id, query.time, lookup)
        .await?;
    debug!(
        track_id = %track_id,
        time = query.time,
        index = segment.index,
        end = segment.end,
        "segment resolved"
    );

    Ok(Json(SegmentResponse {
        cid: info.cid,
        range: segment.range,
        end: segment.end,
    }))
}
