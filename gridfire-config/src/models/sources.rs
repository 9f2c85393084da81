use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::{
    loader::ConfigLoadError,
    util::{bool_var, duration_var, parse_var, path_var, string_var},
};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub ffmpeg: FileFfmpegConfig,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub packager: FilePackagerConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_bytes: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_style: Option<bool>,
    #[serde(default)]
    pub buckets: FileBucketConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBucketConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp3: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFfmpegConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffprobe_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encode_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aac_bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_duration: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePackagerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_seconds: Option<u32>,
}

/// Environment-derived configuration values.
///
/// Legacy unprefixed variable names (`S3_ENDPOINT`,
/// `BUCKET_FLAC`, `TEMP_PATH`, ...) are honoured alongside the `GRIDFIRE_`
/// prefixed ones.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub max_upload_bytes: Option<u64>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub redis_channel: Option<String>,
    pub storage_backend: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_path_style: Option<bool>,
    pub bucket_src: Option<String>,
    pub bucket_flac: Option<String>,
    pub bucket_mp4: Option<String>,
    pub bucket_mp3: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    pub encode_timeout: Option<Duration>,
    pub aac_bitrate: Option<String>,
    pub fragment_duration: Option<Duration>,
    pub worker_count: Option<usize>,
    pub lease_ttl: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub poll_interval: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub scratch_dir: Option<PathBuf>,
    pub segment_seconds: Option<u32>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Ok(Self {
            config_path: path_var(&["GRIDFIRE_CONFIG"]),
            server_host: string_var(&["GRIDFIRE_HOST", "SERVER_HOST"]),
            server_port: parse_var(&["GRIDFIRE_PORT", "SERVER_PORT", "PORT"], "a port")?,
            max_upload_bytes: parse_var(
                &["GRIDFIRE_MAX_UPLOAD_BYTES"],
                "a byte count",
            )?,
            database_url: string_var(&["DATABASE_URL"]),
            database_max_connections: parse_var(
                &["DATABASE_MAX_CONNECTIONS"],
                "a connection count",
            )?,
            redis_url: string_var(&["REDIS_URL"]),
            redis_channel: string_var(&["GRIDFIRE_REDIS_CHANNEL"]),
            storage_backend: string_var(&["GRIDFIRE_STORAGE_BACKEND"]),
            storage_root: path_var(&["GRIDFIRE_STORAGE_ROOT"]),
            s3_endpoint: string_var(&["GRIDFIRE_S3_ENDPOINT", "S3_ENDPOINT"]),
            s3_region: string_var(&["GRIDFIRE_S3_REGION", "AWS_REGION"]),
            s3_access_key: string_var(&[
                "GRIDFIRE_S3_ACCESS_KEY",
                "AWS_ACCESS_KEY_ID",
            ]),
            s3_secret_key: string_var(&[
                "GRIDFIRE_S3_SECRET_KEY",
                "AWS_SECRET_ACCESS_KEY",
            ]),
            s3_path_style: bool_var(&["GRIDFIRE_S3_PATH_STYLE"])?,
            bucket_src: string_var(&["GRIDFIRE_BUCKET_SRC", "BUCKET_SRC"]),
            bucket_flac: string_var(&["GRIDFIRE_BUCKET_FLAC", "BUCKET_FLAC"]),
            bucket_mp4: string_var(&["GRIDFIRE_BUCKET_MP4", "BUCKET_MP4"]),
            bucket_mp3: string_var(&["GRIDFIRE_BUCKET_MP3", "BUCKET_MP3"]),
            ffmpeg_path: string_var(&["FFMPEG_PATH"]),
            ffprobe_path: string_var(&["FFPROBE_PATH"]),
            encode_timeout: duration_var(&["GRIDFIRE_ENCODE_TIMEOUT"])?,
            aac_bitrate: string_var(&["GRIDFIRE_AAC_BITRATE"]),
            fragment_duration: duration_var(&["GRIDFIRE_FRAGMENT_DURATION"])?,
            worker_count: parse_var(&["GRIDFIRE_WORKERS"], "a worker count")?,
            lease_ttl: duration_var(&["GRIDFIRE_LEASE_TTL"])?,
            max_attempts: parse_var(
                &["GRIDFIRE_MAX_ATTEMPTS"],
                "an attempt count",
            )?,
            poll_interval: duration_var(&["GRIDFIRE_POLL_INTERVAL"])?,
            job_timeout: duration_var(&["GRIDFIRE_JOB_TIMEOUT"])?,
            scratch_dir: path_var(&["GRIDFIRE_SCRATCH_DIR", "TEMP_PATH"]),
            segment_seconds: parse_var(
                &["GRIDFIRE_SEGMENT_SECONDS"],
                "a whole number of seconds",
            )?,
        })
    }
}
