use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;
use uuid::Uuid;

use super::{
    content_type_for, extension_of, validate_key, BodyStream, ObjectMetadata, ObjectStore,
    StoreError, StoreResult, TemporaryUrl, UploadDescriptor,
};
use crate::entities::asset::{ContentKind, StorageProvider};

/// Object store rooted at a directory (local disk or a mounted share).
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// The root must already exist; it is canonicalized so `file://` references
    /// are absolute.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let meta = fs::metadata(root).await.map_err(|e| {
            StoreError::Config(format!("cannot access storage root {}: {}", root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::Config(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }
        let root = fs::canonicalize(root)
            .await
            .map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StoreResult<(String, PathBuf)> {
        let key = validate_key(path)?;
        let full = self.root.join(&key);
        Ok((key, full))
    }
}

fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Temp file that is unlinked when dropped unless it was renamed into place.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        // A single unlink; doing it inline keeps the directory clean by the
        // time the cancelled future has been dropped.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if !is_not_found(&e) {
                tracing::warn!(path = %self.path.display(), error = %e, "Storage | failed to remove partial file");
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Filesystem
    }

    async fn put(
        &self,
        mut body: BodyStream<'_>,
        path: &str,
        kind: ContentKind,
    ) -> StoreResult<UploadDescriptor> {
        let (key, full) = self.resolve(path)?;
        let dir = full
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(key.clone()))?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::write(&key, e))?;

        // Stream into a sibling temp file and rename, so readers never see a
        // half-written object under the final key. The guard removes the temp
        // file on every exit that skips the rename, including a cancelled put.
        let mut partial = PartialFile::new(dir.join(format!(".{}.partial", Uuid::new_v4())));
        let written = async {
            let mut file = fs::File::create(partial.path()).await?;
            let mut written: u64 = 0;
            while let Some(chunk) = body.try_next().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(partial.path(), &full).await?;
            partial.persisted();
            Ok::<u64, io::Error>(written)
        }
        .await
        .map_err(|e| StoreError::write(&key, e))?;

        tracing::debug!(path = %key, size = written, "Storage | filesystem put");
        Ok(UploadDescriptor {
            provider: StorageProvider::Filesystem,
            format: extension_of(&key).unwrap_or_default(),
            path: key,
            size: written,
            kind,
        })
    }

    async fn get(&self, path: &str) -> StoreResult<BodyStream<'static>> {
        let (key, full) = self.resolve(path)?;
        let file = fs::File::open(&full).await.map_err(|e| {
            if is_not_found(&e) {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::read(&key, e)
            }
        })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let (key, full) = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(StoreError::write(&key, e)),
        }
    }

    async fn temporary_url(&self, path: &str, _ttl: Duration) -> StoreResult<TemporaryUrl> {
        let (key, full) = self.resolve(path)?;
        fs::metadata(&full).await.map_err(|e| {
            if is_not_found(&e) {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::read(&key, e)
            }
        })?;
        let url = Url::from_file_path(&full)
            .map_err(|_| StoreError::read(&key, "path cannot be expressed as a file URL"))?;
        Ok(TemporaryUrl::Local(url))
    }

    async fn metadata(&self, path: &str) -> StoreResult<ObjectMetadata> {
        let (key, full) = self.resolve(path)?;
        let meta = fs::metadata(&full).await.map_err(|e| {
            if is_not_found(&e) {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::read(&key, e)
            }
        })?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(key));
        }
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|e| StoreError::read(&key, e))?;
        Ok(ObjectMetadata {
            size: meta.len(),
            last_modified,
            content_type: content_type_for(&key).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    fn body(chunks: Vec<&'static [u8]>) -> BodyStream<'static> {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, io::Error>(Bytes::from_static(c))),
        ))
    }

    async fn read_all(mut s: BodyStream<'static>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = s.try_next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn put_get_roundtrip_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        let desc = store
            .put(body(vec![b"frame-1,", b"frame-2"]), "matches/a/b/clip.mp4", ContentKind::Video)
            .await
            .unwrap();
        assert_eq!(desc.path, "matches/a/b/clip.mp4");
        assert_eq!(desc.size, 15);
        assert_eq!(desc.format, "mp4");
        assert_eq!(desc.provider, StorageProvider::Filesystem);

        let data = read_all(store.get("matches/a/b/clip.mp4").await.unwrap()).await;
        assert_eq!(data, b"frame-1,frame-2");

        let meta = store.metadata("matches/a/b/clip.mp4").await.unwrap();
        assert_eq!(meta.size, 15);
        assert_eq!(meta.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();

        assert!(matches!(store.get("nope.json").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.metadata("nope.json").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.temporary_url("nope.json", Duration::from_secs(1)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();
        store
            .put(body(vec![b"x"]), "a.csv", ContentKind::Event)
            .await
            .unwrap();
        store.delete("a.csv").await.unwrap();
        store.delete("a.csv").await.unwrap();
        assert!(matches!(store.get("a.csv").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("root");
        std::fs::create_dir(&inner).unwrap();
        let store = LocalStore::new(&inner).await.unwrap();

        let err = store
            .put(body(vec![b"evil"]), "../escape.json", ContentKind::Tracking)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
        assert!(!dir.path().join("escape.json").exists());
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();
        let failing: BodyStream<'static> = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]));

        let err = store
            .put(failing, "x/broken.mp4", ContentKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(matches!(store.get("x/broken.mp4").await, Err(StoreError::NotFound(_))));
        let leftovers = std::fs::read_dir(dir.path().join("x")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cancelled_put_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();
        let stalled: BodyStream<'static> = Box::pin(
            stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"first chunk"))])
                .chain(stream::pending()),
        );

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            store.put(stalled, "x/stalled.mp4", ContentKind::Video),
        )
        .await;
        assert!(outcome.is_err());

        let leftovers = std::fs::read_dir(dir.path().join("x")).unwrap().count();
        assert_eq!(leftovers, 0);
        assert!(matches!(store.get("x/stalled.mp4").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn temporary_url_is_local_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).await.unwrap();
        store
            .put(body(vec![b"{}"]), "t.json", ContentKind::Tracking)
            .await
            .unwrap();
        let url = store
            .temporary_url("t.json", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!url.is_public());
        assert_eq!(url.url().scheme(), "file");
    }
}
