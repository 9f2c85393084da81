use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, Method},
    routing::{delete, get, patch, post, put},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::{
    AppState,
    handlers::{events, health, stream, tracks, upload},
    infra::identity::USER_ID_HEADER,
};

/// Route templates, shared with the integration tests.
pub mod paths {
    pub const LIVEZ: &str = "/livez";
    pub const READYZ: &str = "/readyz";

    pub const EVENTS: &str = "/api/sse";
    pub const UPLOAD_AUDIO: &str = "/api/upload/audio";

    pub const RELEASES: &str = "/api/release";
    pub const RELEASE: &str = "/api/release/{release_id}";
    pub const RELEASE_TRACKS: &str = "/api/release/{release_id}/track";
    // Both slot routes name their first segment `{track}`: on DELETE it is
    // a track id, on PATCH the position to move from.
    pub const RELEASE_TRACK: &str = "/api/release/{release_id}/track/{track}";
    pub const MOVE_TRACK: &str = "/api/release/{release_id}/track/{track}/{to}";

    pub const TRACK_INIT: &str = "/api/track/{track_id}/init";
    pub const TRACK_STREAM: &str = "/api/track/{track_id}/stream";

    /// Substitutes `{name}` in a template.
    pub fn replace_param(template: &str, name: &str, value: impl std::fmt::Display) -> String {
        template.replace(&format!("{{{name}}}"), &value.to_string())
    }
}

pub fn create_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.max_upload_bytes).unwrap_or(usize::MAX);

    let uploads = Router::new()
        .route(paths::UPLOAD_AUDIO, post(upload::upload_audio))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(upload_limit));

    let api = Router::new()
        .route(paths::EVENTS, get(events::event_stream))
        .route(paths::RELEASES, post(tracks::create_release))
        .route(paths::RELEASE, get(tracks::get_release))
        .route(paths::RELEASE_TRACKS, put(tracks::add_track))
        .route(paths::RELEASE_TRACK, delete(tracks::delete_track))
        .route(paths::MOVE_TRACK, patch(tracks::move_track))
        .route(paths::TRACK_INIT, get(stream::track_init))
        .route(paths::TRACK_STREAM, get(stream::track_segment));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
        ]));

    Router::new()
        .route(paths::LIVEZ, get(health::livez))
        .route(paths::READYZ, get(health::readyz))
        .merge(api)
        .merge(uploads)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };
    use gridfire_core::{notify::NotificationHub, testing::TestPipeline};
    use tower::ServiceExt;

    use super::{create_router, paths};
    use crate::{AppState, infra::identity::USER_ID_HEADER};

    #[tokio::test]
    async fn preflight_allows_the_identity_header() {
        let harness = TestPipeline::new().unwrap();
        let state = AppState::new(
            harness.pipeline.clone(),
            Arc::new(NotificationHub::default()),
            1024,
        );
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri(paths::RELEASES)
            .header(header::ORIGIN, "https://gridfire.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, USER_ID_HEADER)
            .body(Body::empty())
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let allowed = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        assert!(allowed.contains(USER_ID_HEADER));
    }

    #[test]
    fn replace_param_fills_templates() {
        let path = paths::replace_param(paths::RELEASE_TRACK, "release_id", "r1");
        let path = paths::replace_param(&path, "track", 7);
        assert_eq!(path, "/api/release/r1/track/7");
    }
}
