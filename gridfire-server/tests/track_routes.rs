use axum::http::StatusCode;
use gridfire_core::tracks::TrackRepository;
use gridfire_model::{TrackStatus, UserId};
use gridfire_server::routes::paths::{self, replace_param};
use serde_json::{Value, json};

#[path = "support/mod.rs"]
mod support;

use support::{TestApp, USER_ID_HEADER};

fn release_path(template: &str, release: impl std::fmt::Display) -> String {
    replace_param(template, "release_id", release)
}

#[tokio::test]
async fn requests_without_identity_are_rejected() {
    let app = TestApp::new().unwrap();
    let response = app
        .server
        .post(paths::RELEASES)
        .json(&json!({ "title": "Night Drive" }))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], 401);
    assert!(body["error"]["message"].is_string());

    let response = app
        .server
        .post(paths::RELEASES)
        .add_header(USER_ID_HEADER, "not-a-uuid")
        .json(&json!({ "title": "Night Drive" }))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn owner_creates_a_release_and_adds_pending_slots() {
    let app = TestApp::new().unwrap();
    let owner = UserId::new();

    let created = app
        .server
        .post(paths::RELEASES)
        .add_header(USER_ID_HEADER, owner.to_string())
        .json(&json!({ "title": "Night Drive" }))
        .await;
    created.assert_status(StatusCode::CREATED);
    let release: Value = created.json();
    let release_id = release["id"].as_str().unwrap().to_string();
    assert_eq!(release["owner"], owner.to_string());

    let added = app
        .server
        .put(&release_path(paths::RELEASE_TRACKS, &release_id))
        .add_header(USER_ID_HEADER, owner.to_string())
        .json(&json!({ "title": "Intro" }))
        .await;
    added.assert_status(StatusCode::CREATED);
    let track: Value = added.json();
    assert_eq!(track["status"], "pending");
    assert_eq!(track["title"], "Intro");
    assert_eq!(track["releaseId"], release_id);

    // A body is optional.
    app.server
        .put(&release_path(paths::RELEASE_TRACKS, &release_id))
        .add_header(USER_ID_HEADER, owner.to_string())
        .await
        .assert_status(StatusCode::CREATED);

    let view: Value = app
        .server
        .get(&release_path(paths::RELEASE, &release_id))
        .add_header(USER_ID_HEADER, owner.to_string())
        .await
        .json();
    assert_eq!(view["title"], "Night Drive");
    assert_eq!(view["trackList"].as_array().unwrap().len(), 2);
    assert_eq!(view["trackList"][0]["position"], 0);
    assert_eq!(view["trackList"][1]["position"], 1);
}

#[tokio::test]
async fn empty_release_titles_are_bad_requests() {
    let app = TestApp::new().unwrap();
    let response = app
        .server
        .post(paths::RELEASES)
        .add_header(USER_ID_HEADER, UserId::new().to_string())
        .json(&json!({ "title": "   " }))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn only_the_owner_may_touch_a_release() {
    let app = TestApp::new().unwrap();
    let owner = UserId::new();
    let stranger = UserId::new();
    let release = app.release(owner).await;
    let track = app
        .harness
        .pipeline
        .add_track(owner, release.id, "Intro")
        .await
        .unwrap();

    let add = app
        .server
        .put(&release_path(paths::RELEASE_TRACKS, release.id))
        .add_header(USER_ID_HEADER, stranger.to_string())
        .expect_failure()
        .await;
    add.assert_status(StatusCode::FORBIDDEN);
    let body: Value = add.json();
    assert_eq!(body["error"]["status"], 403);

    let delete_path = replace_param(
        &release_path(paths::RELEASE_TRACK, release.id),
        "track",
        track.id,
    );
    app.server
        .delete(&delete_path)
        .add_header(USER_ID_HEADER, stranger.to_string())
        .expect_failure()
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let unchanged = app.harness.tracks.track(release.id, track.id).await.unwrap();
    assert_eq!(unchanged.status, TrackStatus::Pending);
}

#[tokio::test]
async fn unknown_releases_are_not_found() {
    let app = TestApp::new().unwrap();
    let response = app
        .server
        .get(&release_path(paths::RELEASE, gridfire_model::ReleaseId::new()))
        .add_header(USER_ID_HEADER, UserId::new().to_string())
        .expect_failure()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_slot_returns_the_remaining_tracks() {
    let app = TestApp::new().unwrap();
    let owner = UserId::new();
    let release = app.release(owner).await;
    let keep = app
        .harness
        .pipeline
        .add_track(owner, release.id, "Keep")
        .await
        .unwrap();
    let drop = app
        .harness
        .pipeline
        .add_track(owner, release.id, "Drop")
        .await
        .unwrap();

    let path = replace_param(
        &release_path(paths::RELEASE_TRACK, release.id),
        "track",
        drop.id,
    );
    let response = app
        .server
        .delete(&path)
        .add_header(USER_ID_HEADER, owner.to_string())
        .await;
    response.assert_status_ok();
    let view: Value = response.json();
    let remaining = view["trackList"].as_array().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["id"], keep.id.to_string());

    app.server
        .delete(&path)
        .add_header(USER_ID_HEADER, owner.to_string())
        .expect_failure()
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tracks_are_reordered_by_position() {
    let app = TestApp::new().unwrap();
    let owner = UserId::new();
    let release = app.release(owner).await;
    let mut ids = Vec::new();
    for title in ["One", "Two", "Three"] {
        let track = app
            .harness
            .pipeline
            .add_track(owner, release.id, title)
            .await
            .unwrap();
        ids.push(track.id.to_string());
    }

    let path = replace_param(
        &replace_param(&release_path(paths::MOVE_TRACK, release.id), "track", 0),
        "to",
        2,
    );
    let response = app
        .server
        .patch(&path)
        .add_header(USER_ID_HEADER, owner.to_string())
        .await;
    response.assert_status_ok();
    let view: Value = response.json();
    let order: Vec<&str> = view["trackList"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec![ids[1].as_str(), ids[2].as_str(), ids[0].as_str()]);

    let out_of_range = replace_param(
        &replace_param(&release_path(paths::MOVE_TRACK, release.id), "track", 0),
        "to",
        9,
    );
    app.server
        .patch(&out_of_range)
        .add_header(USER_ID_HEADER, owner.to_string())
        .expect_failure()
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_probes_follow_readiness() {
    let app = TestApp::new().unwrap();
    app.server.get(paths::LIVEZ).await.assert_status_ok();
    app.server.get(paths::READYZ).await.assert_status_ok();

    app.state.readiness.mark_draining();
    app.server
        .get(paths::READYZ)
        .expect_failure()
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    app.server.get(paths::LIVEZ).await.assert_status_ok();
}
