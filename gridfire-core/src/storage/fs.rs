use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{
    ByteStream, ObjectBody, ObjectInfo, ObjectStore, StorageError,
    TransferProgress, validate_key,
};

const READ_CHUNK: usize = 64 * 1024;
const STAGING_PREFIX: &str = ".staging-";

/// Object store backed by a local directory; each bucket is a subdirectory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        validate_key(bucket)?;
        if bucket.contains('/') {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn stream_from_bucket(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectBody, StorageError> {
        let path = self.object_path(bucket, key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(bucket, key));
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await.ok().map(|meta| meta.len());
        Ok(ObjectBody {
            size,
            stream: ReaderStream::with_capacity(file, READ_CHUNK).boxed(),
        })
    }

    async fn stream_to_bucket(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        progress: Option<TransferProgress>,
    ) -> Result<u64, StorageError> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await?;

        // The staging path is removed on drop, so an error or a cancelled
        // write never leaves a partial file behind.
        let (file, staging) = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&parent)?
            .into_parts();
        let mut file = fs::File::from_std(file);
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StorageError::Body)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(written);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        staging.persist(&path).map_err(|err| err.error)?;
        debug!(bucket, key, bytes = written, "stored object");
        Ok(written)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let mut pending = vec![bucket_dir.clone()];
        let mut objects = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_dir) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                objects.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::byte_stream;
    use bytes::Bytes;
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    fn body(parts: &[&'static [u8]]) -> ByteStream {
        byte_stream(futures::stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        ))
    }

    async fn read_all(store: &FsObjectStore, bucket: &str, key: &str) -> Vec<u8> {
        let object = store.stream_from_bucket(bucket, key).await.unwrap();
        let mut out = Vec::new();
        let mut stream = object.stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn stores_and_streams_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let seen = Arc::new(AtomicU64::new(0));
        let progress: TransferProgress = {
            let seen = Arc::clone(&seen);
            Arc::new(move |total| seen.store(total, Ordering::SeqCst))
        };

        let written = store
            .stream_to_bucket("src", "r/t.wav", body(&[b"RIFF", b"data"]), Some(progress))
            .await
            .unwrap();

        assert_eq!(written, 8);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
        assert_eq!(read_all(&store, "src", "r/t.wav").await, b"RIFFdata");
    }

    #[tokio::test]
    async fn failed_body_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let failing = byte_stream(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]));

        let err = store
            .stream_to_bucket("src", "r/t.wav", failing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Body(_)));
        assert!(matches!(
            store.stream_from_bucket("src", "r/t.wav").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(store.list_objects("src", "").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("src/r")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let stalled = byte_stream(
            futures::stream::iter(vec![Ok(Bytes::from_static(b"partial"))])
                .chain(futures::stream::pending()),
        );

        let write = store.stream_to_bucket("src", "r/t.wav", stalled, None);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), write)
                .await
                .is_err()
        );

        assert_eq!(std::fs::read_dir(dir.path().join("src/r")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn lists_and_deletes_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for key in ["r/t/init.mp4", "r/t/segment_00000.m4s", "r/t2/init.mp4"] {
            store
                .stream_to_bucket("mp4", key, body(&[b"x"]), None)
                .await
                .unwrap();
        }

        let listed = store.list_objects("mp4", "r/t/").await.unwrap();
        assert_eq!(
            listed.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            ["r/t/init.mp4", "r/t/segment_00000.m4s"]
        );

        assert_eq!(store.delete_objects("mp4", "r/t/").await.unwrap(), 2);
        assert_eq!(store.list_objects("mp4", "").await.unwrap().len(), 1);
        store.delete_object("mp4", "r/t/init.mp4").await.unwrap();
    }
}
