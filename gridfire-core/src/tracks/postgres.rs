use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridfire_model::{
    ByteRange, Cids, Release, ReleaseId, Track, TrackEvent, TrackId, TrackStatus,
    TrackStreamInfo, UserId,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction, postgres::PgRow};
use tracing::debug;
use uuid::Uuid;

use super::{
    RepoResult, RepositoryError, StreamingArtifacts, TrackRepository, reorder,
    stream_projection, target_status,
};

const TRACK_COLUMNS: &str = "id, release_id, title, position, status, duration, cids, \
    init_range, segment_list, segment_duration, segment_timescale, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct PostgresTrackRepository {
    pool: PgPool,
}

impl PostgresTrackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_track(row: &PgRow) -> RepoResult<Track> {
        let status: String = row.try_get("status")?;
        let cids: serde_json::Value = row.try_get("cids")?;
        let segment_list: serde_json::Value = row.try_get("segment_list")?;
        let init_range: Option<String> = row.try_get("init_range")?;
        let segment_duration: Option<i64> = row.try_get("segment_duration")?;
        let segment_timescale: Option<i64> = row.try_get("segment_timescale")?;

        let corrupt = |err: serde_json::Error| RepositoryError::Corrupt(err.to_string());
        let narrow = |value: i64| {
            u32::try_from(value)
                .map_err(|_| RepositoryError::Corrupt(format!("{value} does not fit u32")))
        };

        Ok(Track {
            id: TrackId::from_uuid(row.try_get("id")?),
            release_id: ReleaseId::from_uuid(row.try_get("release_id")?),
            title: row.try_get("title")?,
            position: row.try_get("position")?,
            status: status.parse()?,
            duration: row.try_get("duration")?,
            cids: serde_json::from_value::<Cids>(cids).map_err(corrupt)?,
            init_range: init_range.map(|r| r.parse::<ByteRange>()).transpose()?,
            segment_list: serde_json::from_value(segment_list).map_err(corrupt)?,
            segment_duration: segment_duration.map(narrow).transpose()?,
            segment_timescale: segment_timescale.map(narrow).transpose()?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    /// Explains why a conditional update matched no row.
    async fn miss(
        &self,
        release: ReleaseId,
        track: TrackId,
        event: TrackEvent,
    ) -> RepositoryError {
        let current = sqlx::query("SELECT status FROM tracks WHERE id = $1 AND release_id = $2")
            .bind(track.to_uuid())
            .bind(release.to_uuid())
            .fetch_optional(&self.pool)
            .await;
        match current {
            Ok(Some(row)) => match row
                .try_get::<String, _>("status")
                .map_err(RepositoryError::from)
                .and_then(|s| s.parse::<TrackStatus>().map_err(RepositoryError::from))
            {
                Ok(status) => RepositoryError::Conflict {
                    track,
                    status,
                    event,
                },
                Err(err) => err,
            },
            Ok(None) => RepositoryError::TrackNotFound(track),
            Err(err) => err.into(),
        }
    }

    /// Conditional status change. `assign` appends field assignments that
    /// land in the same statement.
    async fn guarded_update<F>(
        &self,
        release: ReleaseId,
        track: TrackId,
        event: TrackEvent,
        assign: F,
    ) -> RepoResult<TrackStatus>
    where
        F: FnOnce(&mut QueryBuilder<'static, Postgres>) + Send,
    {
        let next = target_status(event)?;
        let sources: Vec<String> = TrackStatus::sources(event)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE tracks SET status = ");
        qb.push_bind(next.as_str()).push(", updated_at = NOW()");
        assign(&mut qb);
        qb.push(" WHERE id = ")
            .push_bind(track.to_uuid())
            .push(" AND release_id = ")
            .push_bind(release.to_uuid())
            .push(" AND status = ANY(")
            .push_bind(sources)
            .push(") RETURNING status");

        let updated = qb.build().fetch_optional(&self.pool).await?;
        match updated {
            Some(_) => {
                debug!(track_id = %track, status = %next, "track status updated");
                Ok(next)
            }
            None => Err(self.miss(release, track, event).await),
        }
    }

    async fn release_exists(
        tx: &mut Transaction<'_, Postgres>,
        release: ReleaseId,
    ) -> RepoResult<()> {
        sqlx::query("SELECT id FROM releases WHERE id = $1 FOR UPDATE")
            .bind(release.to_uuid())
            .fetch_optional(&mut **tx)
            .await?
            .map(|_| ())
            .ok_or(RepositoryError::ReleaseNotFound(release))
    }
}

fn map_release(row: &PgRow) -> RepoResult<Release> {
    Ok(Release {
        id: ReleaseId::from_uuid(row.try_get("id")?),
        owner: UserId::from_uuid(row.try_get("owner_id")?),
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ranges_json(ranges: &[ByteRange]) -> serde_json::Value {
    serde_json::Value::Array(
        ranges
            .iter()
            .map(|r| serde_json::Value::String(r.to_string()))
            .collect(),
    )
}

#[async_trait]
impl TrackRepository for PostgresTrackRepository {
    async fn create_release(&self, owner: UserId, title: &str) -> RepoResult<Release> {
        let release = Release::new(owner, title);
        sqlx::query(
            "INSERT INTO releases (id, owner_id, title, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(release.id.to_uuid())
        .bind(owner.to_uuid())
        .bind(&release.title)
        .bind(release.created_at)
        .execute(&self.pool)
        .await?;
        Ok(release)
    }

    async fn release(&self, release: ReleaseId) -> RepoResult<Release> {
        let row = sqlx::query("SELECT id, owner_id, title, created_at FROM releases WHERE id = $1")
            .bind(release.to_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::ReleaseNotFound(release))?;
        map_release(&row)
    }

    async fn add_track(&self, release: ReleaseId, title: &str) -> RepoResult<Track> {
        let mut tx = self.pool.begin().await?;
        Self::release_exists(&mut tx, release).await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM tracks WHERE release_id = $1")
            .bind(release.to_uuid())
            .fetch_one(&mut *tx)
            .await?
            .try_get("count")?;
        let track = Track::new_slot(release, title, i32::try_from(count).unwrap_or(i32::MAX));

        sqlx::query(
            r#"
            INSERT INTO tracks (id, release_id, title, position, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            "#,
        )
        .bind(track.id.to_uuid())
        .bind(release.to_uuid())
        .bind(&track.title)
        .bind(track.position)
        .bind(track.status.as_str())
        .bind(track.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(track)
    }

    async fn track(&self, release: ReleaseId, track: TrackId) -> RepoResult<Track> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = $1 AND release_id = $2");
        let row = sqlx::query(&sql)
            .bind(track.to_uuid())
            .bind(release.to_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::TrackNotFound(track))?;
        Self::map_track(&row)
    }

    async fn find_track(&self, track: TrackId) -> RepoResult<Track> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(track.to_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::TrackNotFound(track))?;
        Self::map_track(&row)
    }

    async fn list_tracks(&self, release: ReleaseId) -> RepoResult<Vec<Track>> {
        self.release(release).await?;
        let sql = format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE release_id = $1 ORDER BY position, created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(release.to_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_track).collect()
    }

    async fn stream_info(&self, track: TrackId) -> RepoResult<TrackStreamInfo> {
        // Only the projected columns are read.
        let row = sqlx::query(
            r#"
            SELECT id, release_id, '' AS title, 0 AS position, status, duration,
                   jsonb_strip_nulls(jsonb_build_object('mp4', cids->'mp4')) AS cids,
                   init_range, segment_list, segment_duration, segment_timescale,
                   created_at, updated_at
            FROM tracks
            WHERE id = $1
            "#,
        )
        .bind(track.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::TrackNotFound(track))?;
        stream_projection(&Self::map_track(&row)?)
    }

    async fn transition(
        &self,
        release: ReleaseId,
        track: TrackId,
        event: TrackEvent,
    ) -> RepoResult<TrackStatus> {
        self.guarded_update(release, track, event, |_| {}).await
    }

    async fn begin_upload(&self, release: ReleaseId, track: TrackId) -> RepoResult<()> {
        self.guarded_update(release, track, TrackEvent::UploadStarted, |qb| {
            qb.push(
                ", cids = '{}'::jsonb, duration = NULL, init_range = NULL, \
                 segment_list = '[]'::jsonb, segment_duration = NULL, \
                 segment_timescale = NULL",
            );
        })
        .await
        .map(|_| ())
    }

    async fn complete_upload(
        &self,
        release: ReleaseId,
        track: TrackId,
        src_cid: &str,
    ) -> RepoResult<()> {
        let cid = src_cid.to_string();
        self.guarded_update(release, track, TrackEvent::UploadCompleted, move |qb| {
            qb.push(", cids = cids || jsonb_build_object('src', ")
                .push_bind(cid)
                .push("::text)");
        })
        .await
        .map(|_| ())
    }

    async fn complete_encode(
        &self,
        release: ReleaseId,
        track: TrackId,
        flac_cid: &str,
    ) -> RepoResult<()> {
        let cid = flac_cid.to_string();
        self.guarded_update(release, track, TrackEvent::EncodeCompleted, move |qb| {
            qb.push(", cids = cids || jsonb_build_object('flac', ")
                .push_bind(cid)
                .push("::text)");
        })
        .await
        .map(|_| ())
    }

    async fn complete_transcode(
        &self,
        release: ReleaseId,
        track: TrackId,
        artifacts: &StreamingArtifacts,
    ) -> RepoResult<()> {
        let artifacts = artifacts.clone();
        self.guarded_update(release, track, TrackEvent::TranscodeCompleted, move |qb| {
            qb.push(", cids = cids || jsonb_build_object('mp4', ")
                .push_bind(artifacts.mp4_cid)
                .push("::text, 'hls', ")
                .push_bind(artifacts.hls_cid)
                .push("::text), duration = ")
                .push_bind(artifacts.duration)
                .push(", init_range = ")
                .push_bind(artifacts.init_range.to_string())
                .push(", segment_list = ")
                .push_bind(ranges_json(&artifacts.segment_list))
                .push(", segment_duration = ")
                .push_bind(i64::from(artifacts.segment_duration))
                .push(", segment_timescale = ")
                .push_bind(i64::from(artifacts.segment_timescale));
        })
        .await
        .map(|_| ())
    }

    async fn record_mp3(
        &self,
        release: ReleaseId,
        track: TrackId,
        mp3_cid: &str,
    ) -> RepoResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE tracks
            SET cids = cids || jsonb_build_object('mp3', $3::text), updated_at = NOW()
            WHERE id = $1 AND release_id = $2 AND status <> 'deleting'
            RETURNING id
            "#,
        )
        .bind(track.to_uuid())
        .bind(release.to_uuid())
        .bind(mp3_cid)
        .fetch_optional(&self.pool)
        .await?;
        match updated {
            Some(_) => Ok(()),
            None => Err(self
                .miss(release, track, TrackEvent::TranscodeCompleted)
                .await),
        }
    }

    async fn move_track(
        &self,
        release: ReleaseId,
        from: usize,
        to: usize,
    ) -> RepoResult<Vec<Track>> {
        let mut tx = self.pool.begin().await?;
        Self::release_exists(&mut tx, release).await?;

        let sql = format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE release_id = $1 \
             ORDER BY position, created_at FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(release.to_uuid())
            .fetch_all(&mut *tx)
            .await?;
        let mut ordered = rows
            .iter()
            .map(Self::map_track)
            .collect::<RepoResult<Vec<_>>>()?;
        reorder(&mut ordered, from, to)?;

        let ids: Vec<Uuid> = ordered.iter().map(|t| t.id.to_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE tracks
            SET position = ordering.idx::integer - 1, updated_at = NOW()
            FROM UNNEST($1::uuid[]) WITH ORDINALITY AS ordering(id, idx)
            WHERE tracks.id = ordering.id
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        for (position, track) in ordered.iter_mut().enumerate() {
            track.position = position as i32;
        }
        Ok(ordered)
    }

    async fn delete_track(&self, release: ReleaseId, track: TrackId) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM tracks WHERE id = $1 AND release_id = $2")
            .bind(track.to_uuid())
            .bind(release.to_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::TrackNotFound(track));
        }
        Ok(())
    }
}
