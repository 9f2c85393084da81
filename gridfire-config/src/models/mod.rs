pub mod sources;

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub storage: StorageConfig,
    pub ffmpeg: FfmpegConfig,
    pub worker: WorkerConfig,
    pub packager: PackagerConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.worker.scratch_dir)?;
        if self.storage.backend == StorageBackend::Filesystem {
            std::fs::create_dir_all(&self.storage.root)?;
        }
        Ok(())
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.worker.scratch_dir
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem,
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "filesystem" | "local" => Ok(StorageBackend::Filesystem),
            "s3" => Ok(StorageBackend::S3),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Filesystem => f.write_str("filesystem"),
            StorageBackend::S3 => f.write_str("s3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend.
    pub root: PathBuf,
    pub s3: Option<S3Config>,
    pub buckets: BucketNames,
}

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Url,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
    pub src: String,
    pub flac: String,
    pub mp4: String,
    pub mp3: String,
}

impl Default for BucketNames {
    fn default() -> Self {
        Self {
            src: "gridfire-src".into(),
            flac: "gridfire-flac".into(),
            mp4: "gridfire-mp4".into(),
            mp3: "gridfire-mp3".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub encode_timeout: Duration,
    pub aac_bitrate: String,
    pub fragment_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackagerConfig {
    pub segment_seconds: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
