use std::{fs, path::PathBuf, time::Duration};

use thiserror::Error;
use url::Url;

use crate::{
    models::{
        BucketNames, Config, ConfigMetadata, DatabaseConfig, FfmpegConfig,
        PackagerConfig, RedisConfig, S3Config, ServerConfig, StorageBackend,
        StorageConfig, WorkerConfig,
        sources::{EnvConfig, FileConfig},
    },
    util::parse_duration,
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] =
    ["gridfire.toml", "config/gridfire.toml"];

/// 200 MiB, the historical upload ceiling.
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;
const DEFAULT_REDIS_CHANNEL: &str = "gridfire:notifications";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env = EnvConfig::gather()?;
        let (file_config, config_path) = self.load_file_config(&env)?;
        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };

        let load = compose_config(file_config, env, metadata)?;
        load.config
            .ensure_directories()
            .map_err(|source| ConfigLoadError::Filesystem { source })?;
        Ok(load)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| {
                ConfigLoadError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

/// Merge environment over file over defaults and run guard rails.
pub(crate) fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if metadata.config_path.is_none() {
        warnings.push_with_hint(
            "No gridfire.toml detected; falling back to environment variables",
            "Set GRIDFIRE_CONFIG or place gridfire.toml in the working directory",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        storage: file_storage,
        ffmpeg: file_ffmpeg,
        worker: file_worker,
        packager: file_packager,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(5000),
        max_upload_bytes: env
            .max_upload_bytes
            .or(file_server.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
    };

    let database = DatabaseConfig {
        url: env
            .database_url
            .or(file_database.url)
            .filter(|url| !url.trim().is_empty()),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(10),
    };

    let redis = match (env.redis_url, file_redis) {
        (Some(url), file) => Some(RedisConfig {
            url,
            channel: env
                .redis_channel
                .clone()
                .or(file.and_then(|f| f.channel))
                .unwrap_or_else(|| DEFAULT_REDIS_CHANNEL.to_string()),
        }),
        (None, Some(file)) => Some(RedisConfig {
            url: file.url,
            channel: env
                .redis_channel
                .clone()
                .or(file.channel)
                .unwrap_or_else(|| DEFAULT_REDIS_CHANNEL.to_string()),
        }),
        (None, None) => None,
    };

    let endpoint = env.s3_endpoint.or(file_storage.endpoint);
    let backend = match env.storage_backend.or(file_storage.backend) {
        Some(raw) => raw.parse::<StorageBackend>().map_err(|value| {
            ConfigLoadError::InvalidValue {
                key: "storage.backend".into(),
                value,
                expected: "`filesystem` or `s3`",
            }
        })?,
        None if endpoint.is_some() => StorageBackend::S3,
        None => StorageBackend::Filesystem,
    };

    let s3 = match endpoint {
        Some(raw) => {
            let endpoint = Url::parse(raw.trim()).map_err(|source| {
                ConfigLoadError::InvalidUrl {
                    key: "storage.endpoint",
                    source,
                }
            })?;
            Some(S3Config {
                endpoint,
                region: env
                    .s3_region
                    .or(file_storage.region)
                    .unwrap_or_else(|| "us-east-1".to_string()),
                access_key: env.s3_access_key.or(file_storage.access_key),
                secret_key: env.s3_secret_key.or(file_storage.secret_key),
                path_style: env
                    .s3_path_style
                    .or(file_storage.path_style)
                    .unwrap_or(true),
            })
        }
        None => None,
    };

    let defaults = BucketNames::default();
    let file_buckets = file_storage.buckets;
    let storage = StorageConfig {
        backend,
        root: env
            .storage_root
            .or(file_storage.root)
            .unwrap_or_else(|| PathBuf::from("./data/objects")),
        s3,
        buckets: BucketNames {
            src: env.bucket_src.or(file_buckets.src).unwrap_or(defaults.src),
            flac: env
                .bucket_flac
                .or(file_buckets.flac)
                .unwrap_or(defaults.flac),
            mp4: env.bucket_mp4.or(file_buckets.mp4).unwrap_or(defaults.mp4),
            mp3: env.bucket_mp3.or(file_buckets.mp3).unwrap_or(defaults.mp3),
        },
    };

    let ffmpeg = FfmpegConfig {
        ffmpeg_path: env
            .ffmpeg_path
            .or(file_ffmpeg.ffmpeg_path)
            .unwrap_or_else(|| "ffmpeg".into()),
        ffprobe_path: env
            .ffprobe_path
            .or(file_ffmpeg.ffprobe_path)
            .unwrap_or_else(|| "ffprobe".into()),
        encode_timeout: pick_duration(
            env.encode_timeout,
            file_ffmpeg.encode_timeout,
            "ffmpeg.encode_timeout",
            Duration::from_secs(30 * 60),
        )?,
        aac_bitrate: env
            .aac_bitrate
            .or(file_ffmpeg.aac_bitrate)
            .unwrap_or_else(|| "256k".into()),
        fragment_duration: pick_duration(
            env.fragment_duration,
            file_ffmpeg.fragment_duration,
            "ffmpeg.fragment_duration",
            Duration::from_secs(1),
        )?,
    };

    let worker = WorkerConfig {
        count: env.worker_count.or(file_worker.count).unwrap_or(2),
        lease_ttl: pick_duration(
            env.lease_ttl,
            file_worker.lease_ttl,
            "worker.lease_ttl",
            Duration::from_secs(40 * 60),
        )?,
        max_attempts: env
            .max_attempts
            .or(file_worker.max_attempts)
            .unwrap_or(5),
        poll_interval: pick_duration(
            env.poll_interval,
            file_worker.poll_interval,
            "worker.poll_interval",
            Duration::from_millis(500),
        )?,
        job_timeout: pick_duration(
            env.job_timeout,
            file_worker.job_timeout,
            "worker.job_timeout",
            Duration::from_secs(35 * 60),
        )?,
        scratch_dir: env
            .scratch_dir
            .or(file_worker.scratch_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("gridfire")),
    };

    let packager = PackagerConfig {
        segment_seconds: env
            .segment_seconds
            .or(file_packager.segment_seconds)
            .unwrap_or(10),
    };

    let config = Config {
        server,
        database,
        redis,
        storage,
        ffmpeg,
        worker,
        packager,
        metadata,
    };

    warnings.extend(validation::apply_guard_rails(&config)?);

    Ok(ConfigLoad { config, warnings })
}

fn pick_duration(
    env: Option<Duration>,
    file: Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    if let Some(value) = env {
        return Ok(value);
    }
    match file {
        Some(raw) => parse_duration(key, &raw),
        None => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}; expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid URL for {key}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("filesystem initialization failed")]
    Filesystem {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn compose(file: Option<FileConfig>, env: EnvConfig) -> ConfigLoad {
        compose_config(file, env, ConfigMetadata::default()).unwrap()
    }

    #[test]
    fn defaults_cover_every_section() {
        let load = compose(None, EnvConfig::default());
        let config = load.config;
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.backend, StorageBackend::Filesystem);
        assert_eq!(config.packager.segment_seconds, 10);
        assert_eq!(config.ffmpeg.encode_timeout, Duration::from_secs(1800));
        assert_eq!(config.storage.buckets, BucketNames::default());
        assert!(load.warnings.iter().any(|w| w.message.contains("DATABASE_URL")));
    }

    #[test]
    fn env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [storage]
            endpoint = "http://minio:9000"

            [storage.buckets]
            flac = "archive"
            mp4 = "dist"

            [worker]
            job_timeout = "40m"
            "#,
        )
        .unwrap();
        let env = EnvConfig {
            server_port: Some(9090),
            bucket_mp4: Some("segments".into()),
            ..EnvConfig::default()
        };

        let config = compose(Some(file), env).config;
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.buckets.flac, "archive");
        assert_eq!(config.storage.buckets.mp4, "segments");
        assert_eq!(config.worker.job_timeout, Duration::from_secs(2400));
        let s3 = config.storage.s3.unwrap();
        assert!(s3.path_style);
        assert_eq!(s3.endpoint.as_str(), "http://minio:9000/");
    }

    #[test]
    fn s3_backend_without_endpoint_is_fatal() {
        let env = EnvConfig {
            storage_backend: Some("s3".into()),
            ..EnvConfig::default()
        };
        let err =
            compose_config(None, env, ConfigMetadata::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::MissingS3Endpoint)
        ));
    }

    #[test]
    fn duplicate_buckets_are_fatal() {
        let env = EnvConfig {
            bucket_flac: Some("shared".into()),
            bucket_mp3: Some("shared".into()),
            ..EnvConfig::default()
        };
        let err =
            compose_config(None, env, ConfigMetadata::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::DuplicateBucket(name)) if name == "shared"
        ));
    }

    #[test]
    fn bad_file_duration_names_the_key() {
        let file: FileConfig = toml::from_str(
            r#"
            [ffmpeg]
            encode_timeout = "forever"
            "#,
        )
        .unwrap();
        let err = compose_config(
            Some(file),
            EnvConfig::default(),
            ConfigMetadata::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ffmpeg.encode_timeout"));
    }

    #[test]
    fn explicit_missing_config_path_fails() {
        let loader = ConfigLoader::new()
            .with_config_path("/definitely/not/here/gridfire.toml");
        let err = loader.load_file_config(&EnvConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn explicit_config_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[packager]\nsegment_seconds = 6").unwrap();
        let loader = ConfigLoader::new().with_config_path(file.path());
        let (parsed, path) =
            loader.load_file_config(&EnvConfig::default()).unwrap();
        assert_eq!(parsed.unwrap().packager.segment_seconds, Some(6));
        assert_eq!(path.as_deref(), Some(file.path()));
    }
}
