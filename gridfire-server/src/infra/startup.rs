//! Process wiring: turns a loaded [`Config`] into a running [`Pipeline`].

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use gridfire_config::{Config, StorageBackend, WorkerConfig};
use gridfire_core::{
    Pipeline, PipelineDeps, ScratchSpace, WorkerSettings,
    crypto::{KeyStore, MemoryKeyStore, PostgresKeyStore},
    notify::{NotificationHub, Notifier, RedisNotifier},
    packager::SegmentPackager,
    queue::{MemoryQueue, PostgresQueue, QueueService, RetryPolicy},
    storage::{Buckets, FsObjectStore, ObjectStore, S3ObjectStore, S3Settings},
    tracks::{MemoryTrackRepository, PostgresTrackRepository, TrackRepository},
    transcode::{FfmpegEngine, FfmpegSettings},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a server or worker process shares.
pub struct Services {
    pub pipeline: Pipeline,
    pub hub: Arc<NotificationHub>,
    /// `None` when state lives in memory.
    pub pool: Option<PgPool>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("pipeline", &self.pipeline)
            .field("durable", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl Services {
    pub fn is_durable(&self) -> bool {
        self.pool.is_some()
    }
}

struct Backends {
    tracks: Arc<dyn TrackRepository>,
    queue: Arc<dyn QueueService>,
    keys: Arc<dyn KeyStore>,
}

pub async fn connect_database(config: &Config) -> anyhow::Result<PgPool> {
    let Some(url) = config.database.url.as_deref() else {
        bail!("DATABASE_URL is not set");
    };
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    gridfire_core::MIGRATOR
        .run(pool)
        .await
        .context("failed to apply database migrations")?;
    info!("database migrations applied");
    Ok(())
}

/// Connects every backend the config names and assembles the pipeline.
pub async fn build_services(config: &Config) -> anyhow::Result<Services> {
    config
        .ensure_directories()
        .context("failed to create storage or scratch directories")?;

    let policy = RetryPolicy::with_max_attempts(config.worker.max_attempts);
    let (backends, pool) = if config.database.url.is_some() {
        let pool = connect_database(config).await?;
        run_migrations(&pool).await?;
        let backends = Backends {
            tracks: Arc::new(PostgresTrackRepository::new(pool.clone())),
            queue: Arc::new(PostgresQueue::new(pool.clone(), policy)),
            keys: Arc::new(PostgresKeyStore::new(pool.clone())),
        };
        (backends, Some(pool))
    } else {
        warn!("no database configured; tracks, jobs and keys are kept in memory");
        let backends = Backends {
            tracks: Arc::new(MemoryTrackRepository::new()),
            queue: Arc::new(MemoryQueue::new(policy)),
            keys: Arc::new(MemoryKeyStore::new()),
        };
        (backends, None)
    };

    let hub = Arc::new(NotificationHub::default());
    let notifier: Arc<dyn Notifier> = match &config.redis {
        Some(redis) => Arc::new(
            RedisNotifier::connect(&redis.url, redis.channel.clone())
                .await
                .context("failed to connect to Redis")?,
        ),
        None => hub.clone(),
    };

    let pipeline = Pipeline::new(PipelineDeps {
        store: object_store(config)?,
        buckets: buckets(config),
        keys: backends.keys,
        engine: Arc::new(FfmpegEngine::new(ffmpeg_settings(config))),
        packager: SegmentPackager::new(config.packager.segment_seconds),
        tracks: backends.tracks,
        queue: backends.queue,
        notifier,
        scratch: ScratchSpace::new(config.scratch_dir()),
        job_timeout: config.worker.job_timeout,
    });

    Ok(Services {
        pipeline,
        hub,
        pool,
    })
}

fn object_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::Filesystem => {
            info!(root = %config.storage.root.display(), "using filesystem object storage");
            Ok(Arc::new(FsObjectStore::new(config.storage.root.clone())))
        }
        StorageBackend::S3 => {
            let Some(s3) = &config.storage.s3 else {
                bail!("S3 storage selected but no endpoint configured");
            };
            info!(endpoint = %s3.endpoint, region = %s3.region, "using S3 object storage");
            Ok(Arc::new(S3ObjectStore::new(S3Settings {
                endpoint: s3.endpoint.clone(),
                region: s3.region.clone(),
                access_key: s3.access_key.clone(),
                secret_key: s3.secret_key.clone(),
                path_style: s3.path_style,
            })))
        }
    }
}

fn buckets(config: &Config) -> Buckets {
    let names = &config.storage.buckets;
    Buckets {
        src: names.src.clone(),
        flac: names.flac.clone(),
        mp4: names.mp4.clone(),
        mp3: names.mp3.clone(),
    }
}

fn ffmpeg_settings(config: &Config) -> FfmpegSettings {
    let ffmpeg = &config.ffmpeg;
    FfmpegSettings {
        ffmpeg_path: PathBuf::from(&ffmpeg.ffmpeg_path),
        ffprobe_path: PathBuf::from(&ffmpeg.ffprobe_path),
        timeout: ffmpeg.encode_timeout,
        aac_bitrate: ffmpeg.aac_bitrate.clone(),
        fragment_duration: ffmpeg.fragment_duration,
    }
}

pub fn worker_settings(config: &WorkerConfig) -> WorkerSettings {
    WorkerSettings {
        count: config.count,
        lease_ttl: config.lease_ttl,
        poll_interval: config.poll_interval,
        reap_interval: reap_interval(config.lease_ttl),
    }
}

/// Sweeps a few times per lease lifetime, at most every 30s.
fn reap_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(30))
}

/// Resolves on SIGINT or SIGTERM and cancels `cancel`.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_interval_tracks_the_lease_ttl() {
        assert_eq!(reap_interval(Duration::from_secs(45 * 60)), Duration::from_secs(30));
        assert_eq!(reap_interval(Duration::from_secs(60)), Duration::from_secs(15));
        assert_eq!(reap_interval(Duration::from_millis(200)), Duration::from_secs(1));
    }

    #[test]
    fn worker_settings_copy_the_configured_pool_shape() {
        let config = WorkerConfig {
            count: 3,
            lease_ttl: Duration::from_secs(120),
            max_attempts: 4,
            poll_interval: Duration::from_millis(250),
            job_timeout: Duration::from_secs(600),
            scratch_dir: PathBuf::from("/tmp/gridfire"),
        };
        let settings = worker_settings(&config);
        assert_eq!(settings.count, 3);
        assert_eq!(settings.lease_ttl, Duration::from_secs(120));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.reap_interval, Duration::from_secs(30));
    }
}
