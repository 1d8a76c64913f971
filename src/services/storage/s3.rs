use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use url::Url;

use super::{
    content_type_for, extension_of, validate_key, BodyStream, ObjectMetadata, ObjectStore,
    StoreError, StoreResult, TemporaryUrl, UploadDescriptor,
};
use crate::config::S3Config;
use crate::entities::asset::{ContentKind, StorageProvider};

/// S3 rejects multipart parts smaller than this (except the last one).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Cloud-blob store on S3 (or any S3-compatible endpoint).
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    pub async fn new(config: S3Config) -> StoreResult<Self> {
        if let Some(endpoint) = &config.endpoint {
            let parsed = Url::parse(endpoint)
                .map_err(|e| StoreError::Config(format!("invalid S3_ENDPOINT: {}", e)))?;
            if parsed.scheme() != "https" && !config.allow_insecure_urls {
                return Err(StoreError::Config(
                    "S3_ENDPOINT must use https (set ALLOW_INSECURE_URLS for local testing)".into(),
                ));
            }
        }

        let region = Region::new(config.region.clone());
        let mut builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = Credentials::new(key_id, secret, None, None, "manual_config");
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        // Retries are driven by `RetryPolicy` so each part's budget is known.
        builder = builder.retry_config(RetryConfig::disabled());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    fn part_size(&self) -> usize {
        self.config.chunk_size.max(MIN_PART_SIZE)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            base_delay: Duration::from_millis(200),
        }
    }

    async fn put_single(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<()> {
        retry(self.retry_policy(), is_transient, || {
            self.client
                .put_object()
                .bucket(&self.config.bucket_name)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(data.clone()))
                .send()
        })
        .await
        .map_err(|e| StoreError::write(key, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Bytes,
        chunker: &mut Chunker,
        body: &mut BodyStream<'_>,
        content_type: &str,
    ) -> StoreResult<u64> {
        let created = retry(self.retry_policy(), is_transient, || {
            self.client
                .create_multipart_upload()
                .bucket(&self.config.bucket_name)
                .key(key)
                .content_type(content_type)
                .send()
        })
        .await
        .map_err(|e| StoreError::write(key, DisplayErrorContext(&e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::write(key, "no upload id returned"))?
            .to_string();
        // From here on a dropped future still aborts the upload.
        let pending = PendingUpload {
            client: self.client.clone(),
            bucket: self.config.bucket_name.clone(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            settled: false,
        };

        let uploaded = match self.upload_parts(key, &upload_id, first, chunker, body).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                pending.abort().await;
                return Err(e);
            }
        };
        let (parts, size) = uploaded;

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let result = retry(self.retry_policy(), is_transient, || {
            self.client
                .complete_multipart_upload()
                .bucket(&self.config.bucket_name)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(completed.clone())
                .send()
        })
        .await;

        if let Err(e) = result {
            pending.abort().await;
            return Err(StoreError::write(key, DisplayErrorContext(&e)));
        }
        pending.completed();
        Ok(size)
    }

    /// Uploads chunks with at most `concurrency` parts in flight. Returning
    /// early drops the `JoinSet`, which aborts the sibling part uploads.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        chunker: &mut Chunker,
        body: &mut BodyStream<'_>,
    ) -> StoreResult<(Vec<CompletedPart>, u64)> {
        let concurrency = self.config.concurrency.max(1);
        let mut in_flight: JoinSet<StoreResult<CompletedPart>> = JoinSet::new();
        let mut parts = Vec::new();
        let mut size: u64 = 0;
        let mut part_number: i32 = 1;
        let mut pending = Some(first);

        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => match chunker.next_chunk(body).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => return Err(StoreError::write(key, e)),
                },
            };
            size += chunk.len() as u64;

            while in_flight.len() >= concurrency {
                match in_flight.join_next().await {
                    Some(joined) => parts.push(joined_part(key, joined)?),
                    None => break,
                }
            }

            let part = PartUpload {
                client: self.client.clone(),
                bucket: self.config.bucket_name.clone(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                part_number,
                policy: self.retry_policy(),
            };
            in_flight.spawn(part.run(chunk));
            part_number += 1;
        }

        while let Some(joined) = in_flight.join_next().await {
            parts.push(joined_part(key, joined)?);
        }

        parts.sort_by_key(|p| p.part_number());
        tracing::debug!(path = %key, parts = parts.len(), size, "Storage | s3 multipart upload assembled");
        Ok((parts, size))
    }
}

/// An open multipart upload. Unless it completes, it is aborted: inline on
/// the error paths, or from a spawned task when the owning future is dropped.
struct PendingUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    settled: bool,
}

impl PendingUpload {
    fn completed(mut self) {
        self.settled = true;
    }

    async fn abort(mut self) {
        self.settled = true;
        abort_upload(&self.client, &self.bucket, &self.key, &self.upload_id).await;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(path = %self.key, upload_id = %self.upload_id, "Storage | multipart upload left open, no runtime to abort it");
            return;
        };
        tracing::debug!(path = %self.key, upload_id = %self.upload_id, "Storage | aborting cancelled multipart upload");
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        runtime.spawn(async move {
            abort_upload(&client, &bucket, &key, &upload_id).await;
        });
    }
}

async fn abort_upload(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    let result = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await;
    if let Err(e) = result {
        tracing::warn!(path = %key, error = %DisplayErrorContext(&e), "Storage | failed to abort multipart upload");
    }
}

fn joined_part(
    key: &str,
    joined: Result<StoreResult<CompletedPart>, tokio::task::JoinError>,
) -> StoreResult<CompletedPart> {
    joined.map_err(|e| StoreError::write(key, e))?
}

struct PartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    policy: RetryPolicy,
}

impl PartUpload {
    async fn run(self, data: Bytes) -> StoreResult<CompletedPart> {
        let output = retry(self.policy, is_transient, || {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .part_number(self.part_number)
                .body(ByteStream::from(data.clone()))
                .send()
        })
        .await
        .map_err(|e| {
            StoreError::write(
                &self.key,
                format!("part {}: {}", self.part_number, DisplayErrorContext(&e)),
            )
        })?;

        Ok(CompletedPart::builder()
            .part_number(self.part_number)
            .set_e_tag(output.e_tag().map(str::to_string))
            .build())
    }
}

/// Splits a byte stream into fixed-size chunks; only the last one may be short.
pub(crate) struct Chunker {
    size: usize,
    buf: BytesMut,
    done: bool,
}

impl Chunker {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            buf: BytesMut::new(),
            done: false,
        }
    }

    pub(crate) async fn next_chunk(&mut self, body: &mut BodyStream<'_>) -> io::Result<Option<Bytes>> {
        loop {
            if self.buf.len() >= self.size {
                return Ok(Some(self.buf.split_to(self.size).freeze()));
            }
            if self.done {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buf.split().freeze()));
            }
            match body.try_next().await? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.done = true,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(5));
        let capped = exp.min(Duration::from_secs(5));
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub(crate) async fn retry<T, E, F, Fut, C>(policy: RetryPolicy, retryable: C, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && retryable(&e) => {
                let delay = policy.delay(attempt);
                tracing::warn!(attempt = attempt + 1, ?delay, "Storage | transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient<E>(err: &SdkError<E, HttpResponse>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status >= 500 || status == 429
        }
        _ => false,
    }
}

fn from_smithy_time(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    fn provider(&self) -> StorageProvider {
        StorageProvider::CloudBlob
    }

    async fn put(
        &self,
        mut body: BodyStream<'_>,
        path: &str,
        kind: ContentKind,
    ) -> StoreResult<UploadDescriptor> {
        let key = validate_key(path)?;
        let content_type = content_type_for(&key);
        let part_size = self.part_size();
        let mut chunker = Chunker::new(part_size);

        let first = chunker
            .next_chunk(&mut body)
            .await
            .map_err(|e| StoreError::write(&key, e))?
            .unwrap_or_default();

        let size = if first.len() < part_size {
            let size = first.len() as u64;
            self.put_single(&key, first, content_type).await?;
            size
        } else {
            self.put_multipart(&key, first, &mut chunker, &mut body, content_type)
                .await?
        };

        tracing::debug!(path = %key, size, "Storage | s3 put");
        Ok(UploadDescriptor {
            provider: StorageProvider::CloudBlob,
            format: extension_of(&key).unwrap_or_default(),
            path: key,
            size,
            kind,
        })
    }

    async fn get(&self, path: &str) -> StoreResult<BodyStream<'static>> {
        let key = validate_key(path)?;
        let resp = retry(self.retry_policy(), is_transient, || {
            self.client
                .get_object()
                .bucket(&self.config.bucket_name)
                .key(&key)
                .send()
        })
        .await
        .map_err(|e| {
            if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::read(&key, DisplayErrorContext(&e))
            }
        })?;
        Ok(Box::pin(ReaderStream::new(resp.body.into_async_read())))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let key = validate_key(path)?;
        // S3 answers 204 for absent keys, so this is idempotent as-is.
        retry(self.retry_policy(), is_transient, || {
            self.client
                .delete_object()
                .bucket(&self.config.bucket_name)
                .key(&key)
                .send()
        })
        .await
        .map_err(|e| StoreError::write(&key, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn temporary_url(&self, path: &str, ttl: Duration) -> StoreResult<TemporaryUrl> {
        let key = validate_key(path)?;
        let presigning = aws_sdk_s3::presigning::PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Config(format!("invalid url ttl: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| StoreError::read(&key, DisplayErrorContext(&e)))?;

        let url = Url::parse(request.uri()).map_err(|e| StoreError::read(&key, e))?;
        if url.scheme() != "https" && !self.config.allow_insecure_urls {
            return Err(StoreError::Config(format!(
                "refusing to issue non-https url for {}",
                key
            )));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Config(format!("invalid url ttl: {}", e)))?;
        Ok(TemporaryUrl::Signed {
            url,
            expires_at: Utc::now() + ttl,
        })
    }

    async fn metadata(&self, path: &str) -> StoreResult<ObjectMetadata> {
        let key = validate_key(path)?;
        let head = retry(self.retry_policy(), is_transient, || {
            self.client
                .head_object()
                .bucket(&self.config.bucket_name)
                .key(&key)
                .send()
        })
        .await
        .map_err(|e| {
            if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::read(&key, DisplayErrorContext(&e))
            }
        })?;

        Ok(ObjectMetadata {
            size: head.content_length().unwrap_or_default().max(0) as u64,
            last_modified: head
                .last_modified()
                .and_then(from_smithy_time)
                .unwrap_or_else(Utc::now),
            content_type: head
                .content_type()
                .unwrap_or_else(|| content_type_for(&key))
                .to_string(),
        })
    }
}
