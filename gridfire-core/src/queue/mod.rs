//! Job queue transport.
//!
//! Delivery is at-least-once: a worker reserves a job under a lease, and the
//! job comes back if the lease is neither acked nor failed before it
//! expires. Stage handlers are written to be re-run from scratch.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridfire_model::{Job, JobId, LeaseId, TrackId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;

pub use memory::MemoryQueue;
#[cfg(feature = "database")]
pub use postgres::PostgresQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("track {0} is being removed; no further jobs are accepted for it")]
    TrackCancelled(TrackId),
    #[error("job payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue backend failure: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn class(&self) -> ErrorClass {
        match self {
            QueueError::TrackCancelled(_) => ErrorClass::Consistency,
            QueueError::Payload(_) => ErrorClass::Content,
            QueueError::Backend(_) => ErrorClass::Transient,
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// A reserved job. Only the holder of `lease_id` may resolve it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub job: Job,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }
}

/// What happened to a job handed back through [`QueueService::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Scheduled { attempt: u32, delay: Duration },
    DeadLettered,
    /// The lease had already expired or been resolved.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub ready: usize,
    pub leased: usize,
    pub dead_letter: usize,
}

/// Exponential backoff with jitter, capped, plus the delivery limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// No delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before delivery number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

#[async_trait]
pub trait QueueService: Send + Sync + fmt::Debug {
    /// Accepts a fully validated job. Fails with
    /// [`QueueError::TrackCancelled`] once the track has been cancelled.
    async fn publish(&self, job: Job) -> Result<JobId, QueueError>;

    async fn reserve(
        &self,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<JobLease>, QueueError>;

    async fn ack(&self, lease: LeaseId) -> Result<(), QueueError>;

    /// Returns the job for another attempt, or dead-letters it once the
    /// delivery limit is reached.
    async fn retry(
        &self,
        lease: LeaseId,
        error: &str,
    ) -> Result<RetryDisposition, QueueError>;

    async fn dead_letter(&self, lease: LeaseId, error: &str)
    -> Result<(), QueueError>;

    /// Drops every pending job for `track` and refuses future ones. Returns
    /// how many queued jobs were removed.
    async fn cancel_track(&self, track: TrackId) -> Result<usize, QueueError>;

    /// Puts jobs whose lease expired back in line. Returns how many.
    async fn requeue_expired(&self) -> Result<u64, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((1.0..=3.0).contains(&delay), "{delay}");
        }
    }

    #[test]
    fn cancelled_tracks_are_consistency_errors() {
        assert_eq!(
            QueueError::TrackCancelled(TrackId::new()).class(),
            ErrorClass::Consistency
        );
        assert_eq!(
            QueueError::Backend("connection reset".into()).class(),
            ErrorClass::Transient
        );
    }
}
