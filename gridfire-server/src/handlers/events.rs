use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use gridfire_model::PipelineEvent;
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::{debug, warn};

use crate::{AppState, infra::identity::Caller};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /api/sse`: the caller's pipeline events as Server-Sent Events.
pub async fn event_stream(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Sse<impl Stream<Item = Result<Event, anyhow::Error>>> {
    debug!(user_id = %user, "event stream opened");
    let receiver = state.hub.subscribe(user);
    let events = futures::StreamExt::take_until(
        pipeline_events(receiver),
        state.shutdown.clone().cancelled_owned(),
    );

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// Frames each event under its wire name. A subscriber that falls behind
/// loses the overflow and keeps going.
pub fn pipeline_events(
    receiver: broadcast::Receiver<PipelineEvent>,
) -> impl Stream<Item = Result<Event, anyhow::Error>> {
    BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Some(
            Event::default()
                .event(event.name())
                .json_data(&event)
                .map_err(anyhow::Error::from),
        ),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged; events dropped");
            None
        }
    })
}
