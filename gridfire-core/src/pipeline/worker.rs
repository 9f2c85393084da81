//! Worker runtime: leases jobs, runs them through the [`Pipeline`] and
//! resolves each lease by its [`JobOutcome`].

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobOutcome, Pipeline};
use crate::queue::{QueueError, RetryDisposition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub count: usize,
    /// How long a reserved job stays invisible to other workers.
    pub lease_ttl: Duration,
    /// Idle wait between reservations when the queue is empty.
    pub poll_interval: Duration,
    pub reap_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 2,
            lease_ttl: Duration::from_secs(45 * 60),
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// A fixed set of worker tasks plus the lease reaper.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Starts `settings.count` workers. They stop reserving once `cancel`
    /// fires; a job already running is allowed to finish.
    pub fn spawn(pipeline: Pipeline, settings: WorkerSettings, cancel: CancellationToken) -> Self {
        let count = settings.count.max(1);
        let mut handles = Vec::with_capacity(count + 1);
        let host = hostname();

        for index in 0..count {
            let worker = format!("{host}:{}:{index}", std::process::id());
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, pipeline, settings, cancel).await;
            }));
        }
        handles.push(tokio::spawn(reaper_loop(
            pipeline,
            settings.reap_interval,
            cancel.clone(),
        )));

        info!(workers = count, "pipeline workers started");
        Self { handles, cancel }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for every task to exit. Call after the token has fired.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("pipeline workers stopped");
    }

    /// Cancels and waits.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }
}

async fn worker_loop(
    worker: String,
    pipeline: Pipeline,
    settings: WorkerSettings,
    cancel: CancellationToken,
) {
    debug!(worker = %worker, "worker started");
    while !cancel.is_cancelled() {
        let idle = match pipeline.run_next(&worker, settings.lease_ttl).await {
            Ok(Some(_)) => continue,
            Ok(None) => settings.poll_interval,
            Err(err) => {
                warn!(worker = %worker, error = %err, "queue unavailable; backing off");
                settings.poll_interval.max(Duration::from_secs(1))
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!(worker = %worker, "worker stopped");
}

async fn reaper_loop(pipeline: Pipeline, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match pipeline.queue().requeue_expired().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "expired leases returned to the queue"),
                    Err(err) => warn!(error = %err, "lease reaper failed"),
                }
            }
        }
    }
}

impl Pipeline {
    /// Reserves and runs a single job. `None` when nothing was ready.
    pub async fn run_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
    ) -> Result<Option<JobOutcome>, QueueError> {
        let queue = self.queue();
        let Some(lease) = queue.reserve(worker, lease_ttl).await? else {
            return Ok(None);
        };

        let outcome = self.process(&lease).await;
        match &outcome {
            JobOutcome::Ack => queue.ack(lease.lease_id).await?,
            JobOutcome::Retry { error } => {
                match queue.retry(lease.lease_id, error).await? {
                    RetryDisposition::Scheduled { attempt, delay } => {
                        info!(job_id = %lease.job_id, attempt, ?delay, "job rescheduled");
                    }
                    RetryDisposition::DeadLettered => {
                        error!(
                            job_id = %lease.job_id,
                            attempts = lease.attempts,
                            error = %error,
                            "job exhausted its retries"
                        );
                        self.abandon(&lease.job, error).await;
                    }
                    RetryDisposition::Stale => {
                        warn!(job_id = %lease.job_id, "lease expired before the retry was recorded");
                    }
                }
            }
            JobOutcome::DeadLetter { error } => {
                queue.dead_letter(lease.lease_id, error).await?;
            }
        }
        Ok(Some(outcome))
    }

    /// Runs jobs until none are ready. Returns how many ran.
    pub async fn drain(&self, worker: &str) -> Result<usize, QueueError> {
        let mut ran = 0;
        while self
            .run_next(worker, WorkerSettings::default().lease_ttl)
            .await?
            .is_some()
        {
            ran += 1;
        }
        Ok(ran)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "gridfire".to_string())
}
