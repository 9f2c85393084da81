//! Cross-process fan-out: workers publish to a Redis channel and each API
//! process relays what it hears into its own [`NotificationHub`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use gridfire_model::{Notification, PipelineEvent, UserId};
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NotificationHub, Notifier};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisNotifier {
    conn: ConnectionManager,
    channel: String,
}

impl fmt::Debug for RedisNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisNotifier")
            .field("connection", &"ConnectionManager")
            .field("channel", &self.channel)
            .finish()
    }
}

impl RedisNotifier {
    pub async fn connect(url: &str, channel: impl Into<String>) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let channel = channel.into();
        info!(channel = %channel, "notifications will be published through Redis");
        Ok(Self { conn, channel })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn send(&self, user: UserId, event: PipelineEvent) {
        let name = event.name();
        let payload = match serde_json::to_string(&Notification {
            user_id: user,
            event,
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode notification");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(err) = conn.publish::<_, _, ()>(self.channel.as_str(), payload).await {
            warn!(user_id = %user, event = name, error = %err, "notification publish failed");
        }
    }
}

/// Relays notifications from Redis into `hub` until `cancel` fires,
/// reconnecting after connection loss.
pub async fn relay_notifications(
    url: String,
    channel: String,
    hub: Arc<NotificationHub>,
    cancel: CancellationToken,
) {
    loop {
        match relay_once(&url, &channel, &hub, &cancel).await {
            Ok(()) => return,
            Err(err) => warn!(error = %err, "notification relay lost its Redis subscription"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn relay_once(
    url: &str,
    channel: &str,
    hub: &NotificationHub,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel, "relaying notifications from Redis");

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = messages.next() => {
                let Some(message) = message else {
                    anyhow::bail!("subscription stream ended");
                };
                let payload: String = message.get_payload()?;
                match serde_json::from_str::<Notification>(&payload) {
                    Ok(notification) => {
                        let delivered = hub.deliver_notification(notification);
                        debug!(delivered, "relayed notification");
                    }
                    Err(err) => warn!(error = %err, "ignoring malformed notification"),
                }
            }
        }
    }
}
