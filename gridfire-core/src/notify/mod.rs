//! Progress and status notifications.
//!
//! Delivery is best-effort: events go to whoever is subscribed for the user
//! right now and are dropped otherwise. Clients re-sync by fetching state.

#[cfg(feature = "database")]
pub mod redis;

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use gridfire_model::{Notification, PipelineEvent, UserId};
use tokio::sync::broadcast;
use tracing::trace;

#[cfg(feature = "database")]
pub use self::redis::{RedisNotifier, relay_notifications};

const DEFAULT_CAPACITY: usize = 256;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Fire-and-forget push to every session of `user`.
    async fn send(&self, user: UserId, event: PipelineEvent);
}

/// Per-user broadcast channels for sessions connected to this process.
#[derive(Debug)]
pub struct NotificationHub {
    channels: DashMap<UserId, broadcast::Sender<PipelineEvent>>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, user: UserId) -> broadcast::Receiver<PipelineEvent> {
        self.channels
            .entry(user)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Delivers to local sessions and returns how many received it.
    pub fn deliver(&self, user: UserId, event: PipelineEvent) -> usize {
        let Some(sender) = self.channels.get(&user).map(|s| s.clone()) else {
            trace!(user_id = %user, event = event.name(), "no sessions; event dropped");
            return 0;
        };
        match sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                // Every receiver is gone.
                self.channels
                    .remove_if(&user, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    pub fn deliver_notification(&self, notification: Notification) -> usize {
        self.deliver(notification.user_id, notification.event)
    }

    pub fn session_count(&self, user: UserId) -> usize {
        self.channels
            .get(&user)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Notifier for NotificationHub {
    async fn send(&self, user: UserId, event: PipelineEvent) {
        self.deliver(user, event);
    }
}
