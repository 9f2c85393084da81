//! Shared configuration library for GridFire.
//!
//! Configuration is composed from an optional `gridfire.toml`, the process
//! environment (after an optional `.env` is loaded) and built-in defaults, in
//! that order of increasing precedence for the environment. Both the API
//! server and standalone workers load their settings through
//! [`ConfigLoader`].

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    BucketNames, Config, ConfigMetadata, DatabaseConfig, FfmpegConfig,
    PackagerConfig, RedisConfig, S3Config, ServerConfig, StorageBackend,
    StorageConfig, WorkerConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
