//! Object store contract and its two backends.
//!
//! Business logic only ever sees `Arc<dyn ObjectStore>`; which backend sits
//! behind it is decided once, from configuration, by [`from_config`].

pub mod local;
pub mod s3;

use std::io;
use std::path::{Component, Path};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use url::Url;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::entities::asset::{ContentKind, StorageProvider};

pub use local::LocalStore;
pub use s3::S3Store;

/// A stream of byte chunks. Uploads accept any borrowed stream (e.g. a
/// multipart field); downloads hand back an owned one.
pub type BodyStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key is empty, absolute, or escapes the store root.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("write to {path} failed: {reason}")]
    Write { path: String, reason: String },

    #[error("read from {path} failed: {reason}")]
    Read { path: String, reason: String },

    #[error("storage configuration error: {0}")]
    Config(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn write(path: &str, reason: impl ToString) -> Self {
        StoreError::Write {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn read(path: &str, reason: impl ToString) -> Self {
        StoreError::Read {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Produced by a successful `put`, consumed once to fill in the asset row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub provider: StorageProvider,
    pub path: String,
    pub size: u64,
    pub kind: ContentKind,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
}

/// Read access to a stored object for a limited time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporaryUrl {
    /// Signed HTTPS URL that is safe to hand to clients.
    Signed { url: Url, expires_at: DateTime<Utc> },
    /// `file://` reference for trusted in-process readers only.
    Local(Url),
}

impl TemporaryUrl {
    pub fn url(&self) -> &Url {
        match self {
            TemporaryUrl::Signed { url, .. } | TemporaryUrl::Local(url) => url,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, TemporaryUrl::Signed { .. })
    }
}

/// Durable byte storage addressed by provider-relative keys.
///
/// Implementations must:
/// - stream `put` input without buffering the whole object;
/// - reject keys that fail [`validate_key`] with `InvalidPath`;
/// - treat `delete` of an absent key as success.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> StorageProvider;

    async fn put(
        &self,
        body: BodyStream<'_>,
        path: &str,
        kind: ContentKind,
    ) -> StoreResult<UploadDescriptor>;

    async fn get(&self, path: &str) -> StoreResult<BodyStream<'static>>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn temporary_url(&self, path: &str, ttl: Duration) -> StoreResult<TemporaryUrl>;

    async fn metadata(&self, path: &str) -> StoreResult<ObjectMetadata>;
}

/// Normalizes a provider-relative key. Only plain segments are allowed, so
/// the resolved object can never sit outside the backend root.
pub fn validate_key(path: &str) -> StoreResult<String> {
    if path.is_empty() || path.contains('\0') || path.contains('\\') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let mut segments = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => match segment.to_str() {
                Some(s) => segments.push(s),
                None => return Err(StoreError::InvalidPath(path.to_string())),
            },
            Component::CurDir => {}
            _ => return Err(StoreError::InvalidPath(path.to_string())),
        }
    }

    if segments.is_empty() || path.ends_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments.join("/"))
}

/// Lower-case extension of a key or file name, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

pub(crate) fn content_type_for(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("json") => "application/json",
        Some("jsonl") => "application/x-ndjson",
        Some("csv") => "text/csv",
        Some("gz") | Some("gzip") => "application/gzip",
        Some("parquet") => "application/vnd.apache.parquet",
        _ => "application/octet-stream",
    }
}

/// Builds the backend selected by configuration.
pub async fn from_config(config: &StorageConfig) -> StoreResult<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackendKind::Filesystem => {
            let root = config.root.as_ref().ok_or_else(|| {
                StoreError::Config("STORAGE_ROOT is required for the filesystem backend".into())
            })?;
            let store = LocalStore::new(root).await?;
            tracing::info!(root = %root.display(), "Storage | using filesystem backend");
            Ok(Arc::new(store))
        }
        StorageBackendKind::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                StoreError::Config("S3_BUCKET_NAME is required for the s3 backend".into())
            })?;
            let store = S3Store::new(s3.clone()).await?;
            tracing::info!(bucket = %s3.bucket_name, "Storage | using s3 backend");
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_keys() {
        assert_eq!(
            validate_key("matches/ab/cd/id/id_video.mp4").unwrap(),
            "matches/ab/cd/id/id_video.mp4"
        );
        assert_eq!(validate_key("./a/./b.json").unwrap(), "a/b.json");
    }

    #[test]
    fn rejects_traversal_and_absolute_keys() {
        for bad in [
            "",
            "/etc/passwd",
            "../outside.mp4",
            "a/../../b",
            "a/..",
            "a\\..\\b",
            "dir/",
            "nul\0byte",
        ] {
            assert!(
                matches!(validate_key(bad), Err(StoreError::InvalidPath(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn extensions_are_lowercased() {
        assert_eq!(extension_of("Match.MP4").as_deref(), Some("mp4"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(content_type_for("x/y.csv"), "text/csv");
    }
}
