use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use gridfire_core::{notify::NotificationHub, testing::TestPipeline};
use gridfire_model::{PipelineEvent, TrackId, TrackStatus, UserId};
use gridfire_server::{AppState, infra::identity::USER_ID_HEADER, routes};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

struct LiveServer {
    addr: SocketAddr,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    _harness: TestPipeline,
}

impl LiveServer {
    async fn start() -> Self {
        let harness = TestPipeline::new().unwrap();
        let hub = Arc::new(NotificationHub::default());
        let shutdown = CancellationToken::new();
        let state = AppState::new(harness.pipeline.clone(), hub.clone(), 1024 * 1024)
            .with_shutdown(shutdown.clone());
        state.readiness.mark_ready();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = routes::create_router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            hub,
            shutdown,
            handle,
            _harness: harness,
        }
    }

    async fn open_events(&self, user: UserId) -> reqwest::Response {
        let response = reqwest::Client::new()
            .get(format!("http://{}{}", self.addr, routes::paths::EVENTS))
            .header(USER_ID_HEADER, user.to_string())
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        response
    }

    async fn wait_for_session(&self, user: UserId) {
        timeout(Duration::from_secs(5), async {
            while self.hub.session_count(user) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event session registered");
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn delivered_events_arrive_as_named_sse_frames() {
    let server = LiveServer::start().await;
    let user = UserId::new();
    let response = server.open_events(user).await;
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    server.wait_for_session(user).await;

    let track = TrackId::new();
    let delivered = server
        .hub
        .deliver(user, PipelineEvent::status(track, TrackStatus::Encoding));
    assert_eq!(delivered, 1);

    let mut body = response.bytes_stream();
    let mut seen = String::new();
    timeout(Duration::from_secs(5), async {
        while !seen.contains("\n\n") || !seen.contains("trackStatus") {
            let chunk = body.next().await.expect("stream open").unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("event frame received");

    assert!(seen.contains("event: trackStatus"), "frame: {seen}");
    assert!(seen.contains(&track.to_string()), "frame: {seen}");
    assert!(seen.contains("\"status\":\"encoding\""), "frame: {seen}");
}

#[tokio::test]
async fn events_for_other_users_are_not_delivered() {
    let server = LiveServer::start().await;
    let listener = UserId::new();
    let _response = server.open_events(listener).await;
    server.wait_for_session(listener).await;

    let delivered = server.hub.deliver(
        UserId::new(),
        PipelineEvent::status(TrackId::new(), TrackStatus::Stored),
    );
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn event_streams_end_on_shutdown() {
    let server = LiveServer::start().await;
    let user = UserId::new();
    let response = server.open_events(user).await;
    server.wait_for_session(user).await;

    server.shutdown.cancel();

    let mut body = response.bytes_stream();
    let finished = timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "stream stayed open after shutdown");
}

#[tokio::test]
async fn event_streams_require_identity() {
    let server = LiveServer::start().await;
    let response = reqwest::Client::new()
        .get(format!("http://{}{}", server.addr, routes::paths::EVENTS))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}
