use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridfire_model::{Job, JobId, LeaseId, TrackId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{JobLease, QueueDepth, QueueError, QueueService, RetryDisposition, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Ready,
    Leased,
    DeadLetter,
}

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    state: EntryState,
    attempts: u32,
    available_at: DateTime<Utc>,
    lease: Option<(LeaseId, String, DateTime<Utc>)>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    // JobIds are v7, so map order is publish order.
    jobs: BTreeMap<JobId, Entry>,
    cancelled: HashSet<TrackId>,
}

impl State {
    fn by_lease(&mut self, lease: LeaseId) -> Option<(JobId, &mut Entry)> {
        self.jobs.iter_mut().find_map(|(id, entry)| {
            (entry.state == EntryState::Leased
                && entry.lease.as_ref().is_some_and(|(held, _, _)| *held == lease))
            .then_some((*id, entry))
        })
    }
}

/// Single-process queue for development and tests.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    policy: RetryPolicy,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
        }
    }

    /// Jobs that are waiting or leased, in publish order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|entry| entry.state != EntryState::DeadLetter)
            .map(|entry| entry.job.clone())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<(Job, Option<String>)> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|entry| entry.state == EntryState::DeadLetter)
            .map(|entry| (entry.job.clone(), entry.last_error.clone()))
            .collect()
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn publish(&self, job: Job) -> Result<JobId, QueueError> {
        let mut state = self.state.lock();
        let track = job.track_id();
        if state.cancelled.contains(&track) {
            return Err(QueueError::TrackCancelled(track));
        }
        let id = JobId::new();
        debug!(job_id = %id, kind = %job.kind(), track_id = %track, "job published");
        state.jobs.insert(
            id,
            Entry {
                job,
                state: EntryState::Ready,
                attempts: 0,
                available_at: Utc::now(),
                lease: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn reserve(
        &self,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<JobLease>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some((job_id, entry)) = state.jobs.iter_mut().find(|(_, entry)| {
            entry.state == EntryState::Ready && entry.available_at <= now
        }) else {
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|err| QueueError::Backend(err.to_string()))?;
        entry.state = EntryState::Leased;
        entry.attempts += 1;
        entry.lease = Some((lease_id, worker.to_string(), expires_at));

        Ok(Some(JobLease {
            lease_id,
            job_id: *job_id,
            job: entry.job.clone(),
            attempts: entry.attempts,
            lease_owner: worker.to_string(),
            expires_at,
        }))
    }

    async fn ack(&self, lease: LeaseId) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let held = state.by_lease(lease).map(|(job_id, _)| job_id);
        if let Some(job_id) = held {
            state.jobs.remove(&job_id);
        }
        Ok(())
    }

    async fn retry(
        &self,
        lease: LeaseId,
        error: &str,
    ) -> Result<RetryDisposition, QueueError> {
        let policy = self.policy;
        let mut state = self.state.lock();
        let Some((job_id, entry)) = state.by_lease(lease) else {
            return Ok(RetryDisposition::Stale);
        };
        entry.lease = None;
        entry.last_error = Some(error.to_string());

        if policy.exhausted(entry.attempts) {
            entry.state = EntryState::DeadLetter;
            warn!(job_id = %job_id, attempts = entry.attempts, error, "job dead-lettered after final attempt");
            return Ok(RetryDisposition::DeadLettered);
        }

        let delay = policy.delay_for(entry.attempts);
        entry.state = EntryState::Ready;
        entry.available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Ok(RetryDisposition::Scheduled {
            attempt: entry.attempts + 1,
            delay,
        })
    }

    async fn dead_letter(&self, lease: LeaseId, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some((_, entry)) = state.by_lease(lease) {
            entry.state = EntryState::DeadLetter;
            entry.lease = None;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn cancel_track(&self, track: TrackId) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        state.cancelled.insert(track);
        let before = state.jobs.len();
        state.jobs.retain(|_, entry| {
            entry.job.track_id() != track || entry.state == EntryState::Leased
        });
        Ok(before - state.jobs.len())
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let policy = self.policy;
        let mut state = self.state.lock();
        let mut requeued = 0;
        for (job_id, entry) in state.jobs.iter_mut() {
            let expired = entry.state == EntryState::Leased
                && entry.lease.as_ref().is_some_and(|(_, _, at)| *at <= now);
            if !expired {
                continue;
            }
            entry.lease = None;
            entry.last_error.get_or_insert_with(|| "lease expired".to_string());
            if policy.exhausted(entry.attempts) {
                entry.state = EntryState::DeadLetter;
                warn!(job_id = %job_id, "expired lease exhausted its attempts");
            } else {
                entry.state = EntryState::Ready;
                entry.available_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for entry in state.jobs.values() {
            match entry.state {
                EntryState::Ready => depth.ready += 1,
                EntryState::Leased => depth.leased += 1,
                EntryState::DeadLetter => depth.dead_letter += 1,
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfire_model::{JobDraft, JobKind, ReleaseId, UserId};

    fn job(kind: JobKind, track: TrackId) -> Job {
        JobDraft::new(kind)
            .user(UserId::new())
            .release(ReleaseId::new())
            .track(track)
            .cid("r/t.wav")
            .build()
            .unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reserves_in_publish_order_and_acks() {
        let queue = MemoryQueue::new(RetryPolicy::immediate(3));
        let track = TrackId::new();
        queue.publish(job(JobKind::TranscodeAac, track)).await.unwrap();
        queue.publish(job(JobKind::TranscodeMp3, track)).await.unwrap();

        let first = queue.reserve("w1", TTL).await.unwrap().unwrap();
        assert_eq!(first.job.kind(), JobKind::TranscodeAac);
        assert_eq!(first.attempts, 1);

        let second = queue.reserve("w2", TTL).await.unwrap().unwrap();
        assert_eq!(second.job.kind(), JobKind::TranscodeMp3);
        assert!(queue.reserve("w3", TTL).await.unwrap().is_none());

        queue.ack(first.lease_id).await.unwrap();
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { ready: 0, leased: 1, dead_letter: 0 });
    }

    #[tokio::test]
    async fn retries_until_the_attempt_limit() {
        let queue = MemoryQueue::new(RetryPolicy::immediate(2));
        queue.publish(job(JobKind::EncodeFlac, TrackId::new())).await.unwrap();

        let lease = queue.reserve("w", TTL).await.unwrap().unwrap();
        assert!(matches!(
            queue.retry(lease.lease_id, "storage timeout").await.unwrap(),
            RetryDisposition::Scheduled { attempt: 2, .. }
        ));
        assert_eq!(
            queue.retry(lease.lease_id, "again").await.unwrap(),
            RetryDisposition::Stale
        );

        let lease = queue.reserve("w", TTL).await.unwrap().unwrap();
        assert!(lease.is_redelivery());
        assert_eq!(
            queue.retry(lease.lease_id, "storage timeout").await.unwrap(),
            RetryDisposition::DeadLettered
        );
        assert_eq!(queue.dead_letters().len(), 1);
        assert!(queue.reserve("w", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered() {
        let queue = MemoryQueue::new(RetryPolicy::immediate(3));
        queue.publish(job(JobKind::EncodeFlac, TrackId::new())).await.unwrap();

        let lost = queue.reserve("crashed", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(queue.requeue_expired().await.unwrap(), 1);

        let again = queue.reserve("w", TTL).await.unwrap().unwrap();
        assert_eq!(again.job_id, lost.job_id);
        assert_eq!(again.attempts, 2);

        // The stale holder can no longer resolve the job.
        queue.ack(lost.lease_id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap().leased, 1);
    }

    #[tokio::test]
    async fn cancelled_tracks_drop_pending_jobs_and_reject_new_ones() {
        let queue = MemoryQueue::default();
        let doomed = TrackId::new();
        let other = TrackId::new();
        queue.publish(job(JobKind::TranscodeAac, doomed)).await.unwrap();
        queue.publish(job(JobKind::TranscodeMp3, doomed)).await.unwrap();
        queue.publish(job(JobKind::TranscodeAac, other)).await.unwrap();

        assert_eq!(queue.cancel_track(doomed).await.unwrap(), 2);
        assert!(matches!(
            queue.publish(job(JobKind::TranscodeMp3, doomed)).await,
            Err(QueueError::TrackCancelled(id)) if id == doomed
        ));
        assert_eq!(queue.pending_jobs().len(), 1);
    }
}
