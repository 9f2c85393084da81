use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridfire_model::{Job, JobId, LeaseId, TrackId};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobLease, QueueDepth, QueueError, QueueService, RetryDisposition, RetryPolicy};

/// Durable queue in `pipeline_jobs`. Workers in any number of processes
/// share it; reservation uses `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("pool_size", &self.pool.size())
            .field("policy", &self.policy)
            .finish()
    }
}

impl PostgresQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl QueueService for PostgresQueue {
    async fn publish(&self, job: Job) -> Result<JobId, QueueError> {
        let id = JobId::new();
        let track = job.track_id();
        let payload = serde_json::to_value(&job)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (id, kind, track_id, payload, state, attempts, available_at)
            SELECT $1, $2, $3, $4, 'ready', 0, NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM pipeline_cancelled_tracks WHERE track_id = $3
            )
            RETURNING id
            "#,
        )
        .bind(id.to_uuid())
        .bind(job.kind().as_str())
        .bind(track.to_uuid())
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            return Err(QueueError::TrackCancelled(track));
        }
        debug!(job_id = %id, kind = %job.kind(), track_id = %track, "job published");
        Ok(id)
    }

    async fn reserve(
        &self,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<JobLease>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, payload, attempts
            FROM pipeline_jobs
            WHERE state = 'ready' AND available_at <= NOW()
            ORDER BY available_at, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let attempts: i32 = row.try_get("attempts")?;
        let job: Job = serde_json::from_value(payload)?;

        let lease_id = LeaseId::new();
        let expires_at: DateTime<Utc> = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|err| QueueError::Backend(err.to_string()))?;

        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'leased',
                attempts = attempts + 1,
                lease_id = $2,
                lease_owner = $3,
                lease_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(lease_id.to_uuid())
        .bind(worker)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(JobLease {
            lease_id,
            job_id: JobId::from_uuid(id),
            job,
            attempts: u32::try_from(attempts + 1).unwrap_or(1),
            lease_owner: worker.to_string(),
            expires_at,
        }))
    }

    async fn ack(&self, lease: LeaseId) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM pipeline_jobs WHERE lease_id = $1 AND state = 'leased'",
        )
        .bind(lease.to_uuid())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            debug!(lease_id = %lease, "ack for a lease that is no longer held");
        }
        Ok(())
    }

    async fn retry(
        &self,
        lease: LeaseId,
        error: &str,
    ) -> Result<RetryDisposition, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, attempts
            FROM pipeline_jobs
            WHERE lease_id = $1 AND state = 'leased'
            FOR UPDATE
            "#,
        )
        .bind(lease.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(RetryDisposition::Stale);
        };
        let id: Uuid = row.try_get("id")?;
        let attempts = u32::try_from(row.try_get::<i32, _>("attempts")?).unwrap_or(0);

        if self.policy.exhausted(attempts) {
            sqlx::query(
                r#"
                UPDATE pipeline_jobs
                SET state = 'dead_letter',
                    lease_id = NULL,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            warn!(job_id = %id, attempts, error, "job dead-lettered after final attempt");
            return Ok(RetryDisposition::DeadLettered);
        }

        let delay = self.policy.delay_for(attempts);
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'ready',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $2,
                available_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(millis(delay))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(RetryDisposition::Scheduled {
            attempt: attempts + 1,
            delay,
        })
    }

    async fn dead_letter(&self, lease: LeaseId, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'dead_letter',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'leased'
            "#,
        )
        .bind(lease.to_uuid())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            warn!(lease_id = %lease, error, "job moved to dead letter");
        }
        Ok(())
    }

    async fn cancel_track(&self, track: TrackId) -> Result<usize, QueueError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_cancelled_tracks (track_id)
            VALUES ($1)
            ON CONFLICT (track_id) DO NOTHING
            "#,
        )
        .bind(track.to_uuid())
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query(
            "DELETE FROM pipeline_jobs WHERE track_id = $1 AND state <> 'leased'",
        )
        .bind(track.to_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let dead = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'dead_letter',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE(last_error, 'lease expired (max attempts)'),
                updated_at = NOW()
            WHERE state = 'leased'
              AND lease_expires_at < NOW()
              AND attempts >= $1
            "#,
        )
        .bind(i32::try_from(self.policy.max_attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if dead > 0 {
            warn!(count = dead, "expired leases exhausted their attempts");
        }

        let requeued = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET state = 'ready',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                available_at = NOW(),
                last_error = COALESCE(last_error, 'lease expired'),
                updated_at = NOW()
            WHERE state = 'leased' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*)::bigint AS count
            FROM pipeline_jobs
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count = usize::try_from(row.try_get::<i64, _>("count")?).unwrap_or(0);
            match state.as_str() {
                "ready" => depth.ready = count,
                "leased" => depth.leased = count,
                "dead_letter" => depth.dead_letter = count,
                _ => {}
            }
        }
        Ok(depth)
    }
}
