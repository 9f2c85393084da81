//! Object storage adapter.
//!
//! Every stage reads its input from, and writes its output to, an
//! [`ObjectStore`]. Bodies always travel as [`ByteStream`]s so large audio
//! files are never buffered whole.

pub mod fs;
#[cfg(feature = "s3")]
pub mod s3;

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream::BoxStream};
use gridfire_model::{ArtifactKind, ReleaseId, TrackId};
use thiserror::Error;
use tracing::debug;

use crate::error::{ErrorClass, io_class};

pub use fs::FsObjectStore;
#[cfg(feature = "s3")]
pub use s3::{S3ObjectStore, S3Settings};

/// A lazily produced sequence of byte chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Callback receiving the running total of bytes transferred.
pub type TransferProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Boxes any chunk stream into a [`ByteStream`].
pub fn byte_stream<S>(stream: S) -> ByteStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    stream.boxed()
}

/// Wraps `stream` so `progress` sees the running byte total after each chunk.
pub fn count_bytes(stream: ByteStream, progress: TransferProgress) -> ByteStream {
    let mut total = 0u64;
    stream
        .inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                total += chunk.len() as u64;
                progress(total);
            }
        })
        .boxed()
}

/// Percentage of `done` over `total`, clamped to `0..=100`.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("storage request failed: {0}")]
    Transient(String),
    #[error("reading request body failed: {0}")]
    Body(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::NotFound { .. } => ErrorClass::NotFound,
            StorageError::InvalidKey(_) => ErrorClass::Validation,
            StorageError::Transient(_) | StorageError::Io(_) => {
                ErrorClass::Transient
            }
            StorageError::Body(err) => io_class(err),
        }
    }

    pub fn not_found(bucket: &str, key: &str) -> Self {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

/// Body of a fetched object.
pub struct ObjectBody {
    pub size: Option<u64>,
    pub stream: ByteStream,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Descriptor returned by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Opens `key` for streaming reads.
    async fn stream_from_bucket(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectBody, StorageError>;

    /// Streams `body` into `key`, returning the number of bytes written.
    /// The object becomes visible only once the whole body was persisted.
    async fn stream_to_bucket(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        progress: Option<TransferProgress>,
    ) -> Result<u64, StorageError>;

    /// Removes `key`. Deleting a missing object is not an error.
    async fn delete_object(&self, bucket: &str, key: &str)
    -> Result<(), StorageError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Lists everything under `prefix` and deletes it, returning the count.
    async fn delete_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<usize, StorageError> {
        let objects = self.list_objects(bucket, prefix).await?;
        let count = objects.len();
        let results: Vec<Result<(), StorageError>> =
            futures::stream::iter(objects)
                .map(|object| async move {
                    self.delete_object(bucket, &object.key).await
                })
                .buffer_unordered(16)
                .collect()
                .await;
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        debug!(bucket, prefix, count, "deleted objects under prefix");
        Ok(count)
    }
}

/// Rejects keys that could escape a bucket or address nothing.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Bucket names per artifact kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    pub src: String,
    pub flac: String,
    pub mp4: String,
    pub mp3: String,
}

impl Buckets {
    pub fn for_kind(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Src => &self.src,
            ArtifactKind::Flac => &self.flac,
            ArtifactKind::Mp4 | ArtifactKind::Hls => &self.mp4,
            ArtifactKind::Mp3 => &self.mp3,
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.src, &self.flac, &self.mp4, &self.mp3]
    }
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            src: "gridfire-src".into(),
            flac: "gridfire-flac".into(),
            mp4: "gridfire-mp4".into(),
            mp3: "gridfire-mp3".into(),
        }
    }
}

/// Storage key layout.
pub mod keys {
    use super::*;

    /// `{releaseId}/{trackId}{ext}` for raw uploads.
    pub fn source(release: ReleaseId, track: TrackId, ext: &str) -> String {
        format!("{release}/{track}{ext}")
    }

    /// `{releaseId}/{trackId}` for the archival FLAC and the MP3.
    pub fn archive(release: ReleaseId, track: TrackId) -> String {
        format!("{release}/{track}")
    }

    /// `{releaseId}/{trackId}/{file}` for distribution files.
    pub fn distribution(release: ReleaseId, track: TrackId, file: &str) -> String {
        format!("{release}/{track}/{file}")
    }

    /// Prefix covering every artifact of a track in any bucket.
    pub fn track_prefix(release: ReleaseId, track: TrackId) -> String {
        archive(release, track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_release_track_layout() {
        let release = ReleaseId::new();
        let track = TrackId::new();
        assert_eq!(keys::source(release, track, ".wav"), format!("{release}/{track}.wav"));
        assert_eq!(keys::archive(release, track), format!("{release}/{track}"));
        assert_eq!(
            keys::distribution(release, track, "init.mp4"),
            format!("{release}/{track}/init.mp4")
        );
        assert!(keys::source(release, track, ".wav")
            .starts_with(&keys::track_prefix(release, track)));
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in ["", "/abs", "a/../b", "a//b", "a\\b", "./a"] {
            assert!(validate_key(key).is_err(), "{key:?}");
        }
        assert!(validate_key("r/t/segment_00001.m4s").is_ok());
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(0, 10), 0);
        assert_eq!(percent_of(5, 10), 50);
        assert_eq!(percent_of(15, 10), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
