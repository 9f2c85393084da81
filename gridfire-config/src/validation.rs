use thiserror::Error;

use crate::models::{Config, StorageBackend};

/// A non-fatal configuration finding surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Hard configuration errors that must stop startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("S3 storage selected but no endpoint configured (set S3_ENDPOINT)")]
    MissingS3Endpoint,
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("segment_seconds must be at least 1")]
    ZeroSegmentLength,
    #[error("bucket names must be distinct; '{0}' is used twice")]
    DuplicateBucket(String),
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    if config.storage.backend == StorageBackend::S3 && config.storage.s3.is_none()
    {
        return Err(ConfigGuardRailError::MissingS3Endpoint);
    }
    if config.worker.count == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if config.worker.max_attempts == 0 {
        return Err(ConfigGuardRailError::NoAttempts);
    }
    if config.packager.segment_seconds == 0 {
        return Err(ConfigGuardRailError::ZeroSegmentLength);
    }

    let buckets = &config.storage.buckets;
    let names = [&buckets.src, &buckets.flac, &buckets.mp4, &buckets.mp3];
    for (i, name) in names.iter().enumerate() {
        if names[i + 1..].contains(name) {
            return Err(ConfigGuardRailError::DuplicateBucket(name.to_string()));
        }
    }

    let mut warnings = ConfigWarnings::default();

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No DATABASE_URL configured; jobs and track state live in memory",
            "Set DATABASE_URL to run more than one process or survive restarts",
        );
    }

    if config.redis.is_none() {
        warnings.push_with_hint(
            "Redis not configured; progress events only reach clients connected to this process",
            "Set REDIS_URL when workers run separately from the API",
        );
    }

    match (&config.storage.backend, &config.storage.s3) {
        (StorageBackend::Filesystem, _) => warnings.push_with_hint(
            format!(
                "Using filesystem object storage at {}",
                config.storage.root.display()
            ),
            "Set GRIDFIRE_STORAGE_BACKEND=s3 and S3_ENDPOINT for shared storage",
        ),
        (StorageBackend::S3, Some(s3))
            if s3.access_key.is_none() || s3.secret_key.is_none() =>
        {
            warnings.push(
                "S3 credentials missing; requests will be sent unsigned",
            )
        }
        _ => {}
    }

    if config.worker.job_timeout < config.ffmpeg.encode_timeout {
        warnings.push(format!(
            "job_timeout ({}) is shorter than encode_timeout ({}); long encodes will be cut off by the worker",
            humantime::format_duration(config.worker.job_timeout),
            humantime::format_duration(config.ffmpeg.encode_timeout),
        ));
    }

    if config.worker.lease_ttl < config.worker.job_timeout {
        warnings.push_with_hint(
            "lease_ttl is shorter than job_timeout; a slow job may be redelivered while still running",
            "Raise GRIDFIRE_LEASE_TTL above GRIDFIRE_JOB_TIMEOUT",
        );
    }

    Ok(warnings)
}
