//! S3-compatible object store using presigned requests.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use rusty_s3::{
    Bucket, Credentials, S3Action, UrlStyle,
    actions::{CreateMultipartUpload, ListObjectsV2},
};
use tracing::{debug, warn};
use url::Url;

use super::{
    ByteStream, ObjectBody, ObjectInfo, ObjectStore, StorageError,
    TransferProgress, validate_key,
};

const SIGN_TTL: Duration = Duration::from_secs(3600);
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Settings {
    pub endpoint: Url,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

pub struct S3ObjectStore {
    client: Client,
    settings: S3Settings,
    credentials: Option<Credentials>,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    pub fn new(settings: S3Settings) -> Self {
        Self::with_client(Client::new(), settings)
    }

    pub fn with_client(client: Client, settings: S3Settings) -> Self {
        let credentials = match (&settings.access_key, &settings.secret_key) {
            (Some(key), Some(secret)) => Some(Credentials::new(key, secret)),
            _ => None,
        };
        Self {
            client,
            settings,
            credentials,
        }
    }

    fn bucket(&self, name: &str) -> Result<Bucket, StorageError> {
        let style = if self.settings.path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        Bucket::new(
            self.settings.endpoint.clone(),
            style,
            name.to_string(),
            self.settings.region.clone(),
        )
        .map_err(|err| StorageError::InvalidKey(format!("{name}: {err}")))
    }

    async fn put_single(
        &self,
        bucket: &Bucket,
        key: &str,
        body: Bytes,
    ) -> Result<(), StorageError> {
        let url = bucket
            .put_object(self.credentials.as_ref(), key)
            .sign(SIGN_TTL);
        let response = self
            .client
            .put(url)
            .body(body)
            .send()
            .await
            .map_err(transient)?;
        expect_success(response, bucket.name(), key).await?;
        Ok(())
    }

    async fn upload_multipart(
        &self,
        bucket: &Bucket,
        key: &str,
        first: Bytes,
        mut body: ByteStream,
        progress: Option<&TransferProgress>,
    ) -> Result<u64, StorageError> {
        let url = bucket
            .create_multipart_upload(self.credentials.as_ref(), key)
            .sign(SIGN_TTL);
        let response = self.client.post(url).send().await.map_err(transient)?;
        let text = expect_success(response, bucket.name(), key)
            .await?
            .text()
            .await
            .map_err(transient)?;
        let created = CreateMultipartUpload::parse_response(text.as_str())
            .map_err(|err| StorageError::Transient(err.to_string()))?;
        let upload_id = created.upload_id().to_string();

        let result: Result<(Vec<String>, u64), StorageError> = async {
            let mut etags = Vec::new();
            let mut written = first.len() as u64;
            etags.push(self.upload_part(bucket, key, &upload_id, 1, first).await?);
            if let Some(progress) = progress {
                progress(written);
            }

            let mut buffer = BytesMut::with_capacity(PART_SIZE);
            loop {
                let next = body.next().await;
                let finished = match next {
                    Some(chunk) => {
                        buffer.extend_from_slice(&chunk.map_err(StorageError::Body)?);
                        false
                    }
                    None => true,
                };
                if buffer.len() >= PART_SIZE || (finished && !buffer.is_empty()) {
                    let part = buffer.split().freeze();
                    written += part.len() as u64;
                    let number = u16::try_from(etags.len() + 1).map_err(|_| {
                        StorageError::Transient("too many multipart parts".into())
                    })?;
                    etags.push(
                        self.upload_part(bucket, key, &upload_id, number, part)
                            .await?,
                    );
                    if let Some(progress) = progress {
                        progress(written);
                    }
                }
                if finished {
                    break;
                }
            }
            Ok((etags, written))
        }
        .await;

        let (etags, written) = match result {
            Ok(done) => done,
            Err(err) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                return Err(err);
            }
        };

        let complete = bucket.complete_multipart_upload(
            self.credentials.as_ref(),
            key,
            &upload_id,
            etags.iter().map(String::as_str),
        );
        let url = complete.sign(SIGN_TTL);
        let response = self
            .client
            .post(url)
            .body(complete.body())
            .send()
            .await
            .map_err(transient);
        match response {
            Ok(response) => {
                expect_success(response, bucket.name(), key).await?;
            }
            Err(err) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                return Err(err);
            }
        }
        Ok(written)
    }

    async fn upload_part(
        &self,
        bucket: &Bucket,
        key: &str,
        upload_id: &str,
        number: u16,
        part: Bytes,
    ) -> Result<String, StorageError> {
        let url = bucket
            .upload_part(self.credentials.as_ref(), key, number, upload_id)
            .sign(SIGN_TTL);
        let response = self
            .client
            .put(url)
            .body(part)
            .send()
            .await
            .map_err(transient)?;
        let response = expect_success(response, bucket.name(), key).await?;
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Transient(format!("part {number} returned no ETag")))
    }

    async fn abort_multipart(&self, bucket: &Bucket, key: &str, upload_id: &str) {
        let url = bucket
            .abort_multipart_upload(self.credentials.as_ref(), key, upload_id)
            .sign(SIGN_TTL);
        if let Err(err) = self.client.delete(url).send().await {
            warn!(bucket = bucket.name(), key, error = %err, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn stream_from_bucket(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectBody, StorageError> {
        validate_key(key)?;
        let target = self.bucket(bucket)?;
        let url = target.get_object(self.credentials.as_ref(), key).sign(SIGN_TTL);
        let response = self.client.get(url).send().await.map_err(transient)?;
        let response = expect_success(response, bucket, key).await?;
        let size = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(ObjectBody { size, stream })
    }

    async fn stream_to_bucket(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        progress: Option<TransferProgress>,
    ) -> Result<u64, StorageError> {
        validate_key(key)?;
        let target = self.bucket(bucket)?;

        let mut buffer = BytesMut::new();
        while buffer.len() < PART_SIZE {
            match body.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk.map_err(StorageError::Body)?),
                None => {
                    let len = buffer.len() as u64;
                    self.put_single(&target, key, buffer.freeze()).await?;
                    if let Some(progress) = &progress {
                        progress(len);
                    }
                    debug!(bucket, key, bytes = len, "stored object");
                    return Ok(len);
                }
            }
        }

        let written = self
            .upload_multipart(&target, key, buffer.freeze(), body, progress.as_ref())
            .await?;
        debug!(bucket, key, bytes = written, "stored object via multipart upload");
        Ok(written)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let target = self.bucket(bucket)?;
        let url = target
            .delete_object(self.credentials.as_ref(), key)
            .sign(SIGN_TTL);
        let response = self.client.delete(url).send().await.map_err(transient)?;
        match expect_success(response, bucket, key).await {
            Ok(_) | Err(StorageError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let target = self.bucket(bucket)?;
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut action = target.list_objects_v2(self.credentials.as_ref());
            if !prefix.is_empty() {
                action.query_mut().insert("prefix", prefix.to_string());
            }
            if let Some(token) = &continuation {
                action
                    .query_mut()
                    .insert("continuation-token", token.clone());
            }
            let url = action.sign(SIGN_TTL);
            let response = self.client.get(url).send().await.map_err(transient)?;
            let text = expect_success(response, bucket, prefix)
                .await?
                .text()
                .await
                .map_err(transient)?;
            let page = ListObjectsV2::parse_response(text.as_str())
                .map_err(|err| StorageError::Transient(err.to_string()))?;

            objects.extend(page.contents.into_iter().map(|entry| ObjectInfo {
                key: entry.key,
                size: entry.size,
                last_modified: DateTime::parse_from_rfc3339(&entry.last_modified)
                    .ok()
                    .map(|at| at.with_timezone(&Utc)),
            }));

            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }
}

fn transient(err: reqwest::Error) -> StorageError {
    StorageError::Transient(err.to_string())
}

async fn expect_success(
    response: reqwest::Response,
    bucket: &str,
    key: &str,
) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::not_found(bucket, key));
    }
    let detail = response.text().await.unwrap_or_default();
    Err(StorageError::Transient(format!(
        "{status} for {bucket}/{key}: {}",
        detail.chars().take(256).collect::<String>()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(path_style: bool) -> S3Settings {
        S3Settings {
            endpoint: Url::parse("http://localhost:9000").unwrap(),
            region: "us-east-1".into(),
            access_key: Some("minio".into()),
            secret_key: Some("minio-secret".into()),
            path_style,
        }
    }

    #[test]
    fn presigned_urls_address_bucket_and_key() {
        let store = S3ObjectStore::new(settings(true));
        let bucket = store.bucket("gridfire-src").unwrap();
        let url = bucket
            .get_object(store.credentials.as_ref(), "r/t.wav")
            .sign(SIGN_TTL);
        assert_eq!(url.path(), "/gridfire-src/r/t.wav");
        assert!(url.query().unwrap_or_default().contains("X-Amz-Signature"));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let rendered = format!("{:?}", S3ObjectStore::new(settings(false)));
        assert!(!rendered.contains("minio-secret"));
        assert!(!rendered.contains("\"minio\""));
    }
}
