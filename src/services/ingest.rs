//! Turns inbound byte streams into tracked assets and owns their processing
//! state. This is the only writer of `processing_state`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::entities::asset::{ContentKind, ProcessingState};
use crate::services::hub::{Hub, HubEvent};
use crate::services::repository::{Asset, AssetFilter, AssetRepository, RepoError};
use crate::services::storage::{
    extension_of, BodyStream, ObjectStore, StoreError, TemporaryUrl, UploadDescriptor,
    DEFAULT_URL_TTL,
};

const MAX_TITLE_LEN: usize = 255;

/// Asset id for error context, when one exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetRef(pub Option<Uuid>);

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{}", id),
            None => f.write_str("-"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("{op} failed (asset {asset}): {source}")]
    StoreWrite {
        op: &'static str,
        asset: AssetRef,
        source: StoreError,
    },

    #[error("{op} failed (asset {asset}): {source}")]
    StoreRead {
        op: &'static str,
        asset: AssetRef,
        source: StoreError,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("asset id already exists: {0}")]
    DuplicateId(Uuid),

    #[error("{op} failed (asset {asset}): {source}")]
    Repository {
        op: &'static str,
        asset: AssetRef,
        source: RepoError,
    },

    #[error("cannot move asset from {from} to {to}")]
    InvalidTransition {
        from: ProcessingState,
        to: ProcessingState,
    },

    #[error("{op} exceeded its deadline")]
    Timeout { op: &'static str },
}

impl IngestError {
    fn store(op: &'static str, asset_id: Option<Uuid>, err: StoreError) -> Self {
        let asset = AssetRef(asset_id);
        match err {
            StoreError::InvalidPath(path) => IngestError::InvalidPath(path),
            StoreError::NotFound(path) => IngestError::NotFound(format!("stored object {}", path)),
            err @ StoreError::Read { .. } => IngestError::StoreRead { op, asset, source: err },
            err => IngestError::StoreWrite { op, asset, source: err },
        }
    }

    fn repo(op: &'static str, asset_id: Option<Uuid>, err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => IngestError::NotFound(format!("asset {}", id)),
            RepoError::DuplicateId(id) => IngestError::DuplicateId(id),
            err => IngestError::Repository {
                op,
                asset: AssetRef(asset_id),
                source: err,
            },
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation_error",
            IngestError::InvalidPath(_) => "invalid_path",
            IngestError::StoreWrite { .. } => "store_write_error",
            IngestError::StoreRead { .. } => "store_read_error",
            IngestError::NotFound(_) => "not_found",
            IngestError::DuplicateId(_) => "duplicate_id",
            IngestError::Repository { .. } => "repository_error",
            IngestError::InvalidTransition { .. } => "invalid_transition",
            IngestError::Timeout { .. } => "timeout",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::StoreWrite { .. }
                | IngestError::StoreRead { .. }
                | IngestError::Repository { .. }
                | IngestError::Timeout { .. }
        )
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Client-declared descriptive metadata for a new asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclaredMetadata {
    pub title: String,
    pub description: Option<String>,
    pub match_id: Option<String>,
    pub match_date: Option<NaiveDateTime>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub competition: Option<String>,
    pub season: Option<String>,
    pub duration: Option<f64>,
    pub resolution: Option<String>,
}

impl DeclaredMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> IngestResult<()> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(IngestError::Validation("title is required".into()));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(IngestError::Validation(format!(
                "title must be at most {} characters",
                MAX_TITLE_LEN
            )));
        }
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(IngestError::Validation("duration must be a non-negative number".into()));
            }
        }
        if matches!(&self.match_id, Some(id) if id.trim().is_empty()) {
            return Err(IngestError::Validation("match_id must not be blank".into()));
        }
        Ok(())
    }
}

/// One typed file of an ingest call.
pub struct IngestPart<'a> {
    pub kind: ContentKind,
    pub file_name: String,
    pub body: BodyStream<'a>,
}

impl<'a> IngestPart<'a> {
    pub fn new(kind: ContentKind, file_name: impl Into<String>, body: BodyStream<'a>) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Deadline for each individual store or repository call.
    pub operation_timeout: Duration,
    pub url_ttl: Duration,
    pub max_page_size: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(300),
            url_ttl: DEFAULT_URL_TTL,
            max_page_size: 100,
        }
    }
}

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn AssetRepository>,
    hub: Hub,
    settings: IngestSettings,
    processing: Option<mpsc::Sender<Uuid>>,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn AssetRepository>,
        hub: Hub,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            repo,
            hub,
            settings,
            processing: None,
        }
    }

    /// Newly pending assets are announced on `queue` for the processing worker.
    pub fn with_processing_queue(mut self, queue: mpsc::Sender<Uuid>) -> Self {
        self.processing = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn AssetRepository> {
        &self.repo
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> IngestResult<T>
    where
        F: Future<Output = IngestResult<T>>,
    {
        tokio::time::timeout(self.settings.operation_timeout, fut)
            .await
            .map_err(|_| IngestError::Timeout { op })?
    }

    /// Starts a multi-part ingest after validating the declared metadata.
    pub fn begin(&self, metadata: DeclaredMetadata) -> IngestResult<IngestSession> {
        metadata.validate()?;
        Ok(IngestSession {
            service: self.clone(),
            asset_id: Uuid::new_v4(),
            metadata,
            stored: Vec::new(),
            committed: false,
        })
    }

    /// Validates everything up front, stores each part, then records the
    /// asset as `pending`. Nothing is written when validation fails.
    pub async fn ingest(
        &self,
        parts: Vec<IngestPart<'_>>,
        metadata: DeclaredMetadata,
    ) -> IngestResult<Asset> {
        metadata.validate()?;
        if parts.is_empty() {
            return Err(IngestError::Validation("at least one file part is required".into()));
        }
        let mut seen = Vec::with_capacity(parts.len());
        for part in &parts {
            if seen.contains(&part.kind) {
                return Err(IngestError::Validation(format!("duplicate {} part", part.kind)));
            }
            seen.push(part.kind);
            validate_extension(part.kind, &part.file_name)?;
        }

        let mut session = self.begin(metadata)?;
        for part in parts {
            session.add_part(part.kind, &part.file_name, part.body).await?;
        }
        session.commit().await
    }

    pub async fn get(&self, id: Uuid) -> IngestResult<Asset> {
        self.deadline("repository.find", async {
            self.repo
                .find_by_id(id)
                .await
                .map_err(|e| IngestError::repo("repository.find", Some(id), e))
        })
        .await?
        .ok_or_else(|| IngestError::NotFound(format!("asset {}", id)))
    }

    /// Moves an asset along the processing state machine and announces the
    /// change once the repository holds it.
    pub async fn advance_state(
        &self,
        id: Uuid,
        target: ProcessingState,
        failure_reason: Option<String>,
    ) -> IngestResult<Asset> {
        let current = self.get(id).await?;
        let from = current.processing_state;
        if !from.can_transition_to(target) {
            return Err(IngestError::InvalidTransition { from, to: target });
        }

        let reason = match target {
            ProcessingState::Failed => Some(
                failure_reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "unspecified".to_string()),
            ),
            _ => None,
        };

        let updated = self
            .deadline("repository.transition", async {
                self.repo
                    .transition_state(id, from, target, reason)
                    .await
                    .map_err(|e| match e {
                        RepoError::StateConflict { actual, .. } => {
                            IngestError::InvalidTransition { from: actual, to: target }
                        }
                        e => IngestError::repo("repository.transition", Some(id), e),
                    })
            })
            .await?;

        self.hub.publish(HubEvent::StateChanged {
            asset_id: id,
            from_state: from,
            to_state: target,
            timestamp: updated.updated_at.and_utc(),
        });
        tracing::info!(asset = %id, from = %from, to = %target, "Ingest | state advanced");

        if target == ProcessingState::Pending {
            self.signal_processing(id);
        }
        Ok(updated)
    }

    pub async fn stream_url(&self, id: Uuid) -> IngestResult<TemporaryUrl> {
        let asset = self.get(id).await?;
        self.deadline("store.temporary_url", async {
            self.store
                .temporary_url(&asset.storage_path, self.settings.url_ttl)
                .await
                .map_err(|e| IngestError::store("store.temporary_url", Some(id), e))
        })
        .await
    }

    /// Opens the primary object of a live asset for in-process streaming.
    pub async fn open_content(&self, id: Uuid) -> IngestResult<(Asset, BodyStream<'static>)> {
        let asset = self.get(id).await?;
        let body = self
            .deadline("store.get", async {
                self.store
                    .get(&asset.storage_path)
                    .await
                    .map_err(|e| IngestError::store("store.get", Some(id), e))
            })
            .await?;
        Ok((asset, body))
    }

    pub async fn list(&self, filter: AssetFilter, limit: i64, offset: u64) -> IngestResult<Vec<Asset>> {
        let filter = self.validate_filter(filter)?;
        let limit = limit.min(self.settings.max_page_size as i64);
        self.deadline("repository.find", async {
            self.repo
                .find(&filter, limit, offset)
                .await
                .map_err(|e| IngestError::repo("repository.find", None, e))
        })
        .await
    }

    pub async fn count(&self, filter: AssetFilter) -> IngestResult<u64> {
        let filter = self.validate_filter(filter)?;
        self.deadline("repository.count", async {
            self.repo
                .count(&filter)
                .await
                .map_err(|e| IngestError::repo("repository.count", None, e))
        })
        .await
    }

    fn validate_filter(&self, mut filter: AssetFilter) -> IngestResult<AssetFilter> {
        for (name, value) in [("match_id", &mut filter.match_id), ("participant", &mut filter.participant)] {
            if let Some(v) = value {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    return Err(IngestError::Validation(format!("{} filter must not be blank", name)));
                }
                *v = trimmed.to_string();
            }
        }
        if let (Some(from), Some(to)) = (filter.date_from, filter.date_to) {
            if from > to {
                return Err(IngestError::Validation("date range start is after its end".into()));
            }
        }
        Ok(filter)
    }

    /// Soft-deletes the metadata row; stored bytes are left for the
    /// retention cleanup.
    pub async fn delete(&self, id: Uuid) -> IngestResult<()> {
        self.deadline("repository.soft_delete", async {
            self.repo
                .soft_delete(id)
                .await
                .map_err(|e| IngestError::repo("repository.soft_delete", Some(id), e))
        })
        .await?;

        self.hub.publish(HubEvent::AssetDeleted {
            asset_id: id,
            timestamp: Utc::now(),
        });
        tracing::info!(asset = %id, "Ingest | asset soft-deleted");
        Ok(())
    }

    fn signal_processing(&self, id: Uuid) {
        let Some(queue) = &self.processing else {
            return;
        };
        match queue.try_send(id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(asset = %id, "Ingest | processing queue full, asset stays pending");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(asset = %id, "Ingest | processing worker is gone, asset stays pending");
            }
        }
    }

    async fn cleanup_orphans(store: Arc<dyn ObjectStore>, asset_id: Uuid, paths: Vec<String>) {
        for path in paths {
            match store.delete(&path).await {
                Ok(()) => tracing::info!(asset = %asset_id, path = %path, "Ingest | removed orphaned object"),
                Err(e) => tracing::error!(asset = %asset_id, path = %path, error = %e, "Ingest | orphan cleanup failed"),
            }
        }
    }
}

/// Returns the normalized extension when `file_name` is allowed for `kind`.
pub fn validate_extension(kind: ContentKind, file_name: &str) -> IngestResult<String> {
    let allowed = kind.allowed_extensions();
    match extension_of(file_name) {
        Some(ext) if allowed.contains(&ext.as_str()) => Ok(ext),
        _ => Err(IngestError::Validation(format!(
            "{} file '{}' must have one of the extensions: {}",
            kind,
            file_name,
            allowed.join(", ")
        ))),
    }
}

/// `matches/{id[0..2]}/{id[2..4]}/{id}/{id}_{kind}.{ext}`
pub fn storage_key(asset_id: Uuid, kind: ContentKind, ext: &str) -> String {
    let id = asset_id.to_string();
    format!("matches/{}/{}/{}/{}_{}.{}", &id[0..2], &id[2..4], id, id, kind, ext)
}

/// A multi-part ingest in progress. Parts are stored as they arrive; the
/// asset row is only written by [`IngestSession::commit`]. Dropping an
/// uncommitted session schedules deletion of everything it stored.
pub struct IngestSession {
    service: IngestService,
    asset_id: Uuid,
    metadata: DeclaredMetadata,
    stored: Vec<UploadDescriptor>,
    committed: bool,
}

impl IngestSession {
    pub fn asset_id(&self) -> Uuid {
        self.asset_id
    }

    pub fn stored(&self) -> &[UploadDescriptor] {
        &self.stored
    }

    pub async fn add_part(
        &mut self,
        kind: ContentKind,
        file_name: &str,
        body: BodyStream<'_>,
    ) -> IngestResult<&UploadDescriptor> {
        if self.stored.iter().any(|d| d.kind == kind) {
            return Err(IngestError::Validation(format!("duplicate {} part", kind)));
        }
        let ext = validate_extension(kind, file_name)?;
        let path = storage_key(self.asset_id, kind, &ext);
        let id = self.asset_id;
        let store = Arc::clone(&self.service.store);

        let descriptor = self
            .service
            .deadline("store.put", async move {
                store
                    .put(body, &path, kind)
                    .await
                    .map_err(|e| IngestError::store("store.put", Some(id), e))
            })
            .await?;

        tracing::debug!(asset = %id, kind = %kind, path = %descriptor.path, size = descriptor.size, "Ingest | part stored");
        self.stored.push(descriptor);
        Ok(&self.stored[self.stored.len() - 1])
    }

    pub fn require_kinds(&self, kinds: &[ContentKind]) -> IngestResult<()> {
        let missing: Vec<&str> = kinds
            .iter()
            .filter(|k| !self.stored.iter().any(|d| d.kind == **k))
            .map(|k| k.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Validation(format!(
                "missing required file parts: {}",
                missing.join(", ")
            )))
        }
    }

    fn part(&self, kind: ContentKind) -> Option<&UploadDescriptor> {
        self.stored.iter().find(|d| d.kind == kind)
    }

    fn build_asset(&self) -> Option<Asset> {
        let primary = self
            .part(ContentKind::Video)
            .or_else(|| self.part(ContentKind::Tracking))
            .or_else(|| self.part(ContentKind::Event))?;
        let tracking = self.part(ContentKind::Tracking);
        let now = Utc::now().naive_utc();
        let meta = &self.metadata;

        Some(Asset {
            id: self.asset_id,
            title: meta.title.trim().to_string(),
            description: meta.description.clone(),
            content_kind: primary.kind,
            storage_provider: primary.provider,
            storage_path: primary.path.clone(),
            format: primary.format.clone(),
            size: primary.size as i64,
            duration: meta.duration,
            resolution: meta.resolution.clone(),
            processing_state: ProcessingState::Pending,
            failure_reason: None,
            match_id: meta.match_id.as_ref().map(|m| m.trim().to_string()),
            match_date: meta.match_date,
            home_team: meta.home_team.clone(),
            away_team: meta.away_team.clone(),
            competition: meta.competition.clone(),
            season: meta.season.clone(),
            has_tracking_data: tracking.is_some(),
            tracking_path: tracking.map(|d| d.path.clone()),
            event_path: self.part(ContentKind::Event).map(|d| d.path.clone()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            purged_at: None,
        })
    }

    /// Records the asset as `pending`. On failure the stored bytes are
    /// scheduled for removal and the whole upload has to be retried.
    pub async fn commit(mut self) -> IngestResult<Asset> {
        let asset = self
            .build_asset()
            .ok_or_else(|| IngestError::Validation("at least one file part is required".into()))?;
        let id = asset.id;
        let repo = Arc::clone(&self.service.repo);

        let created = self
            .service
            .deadline("repository.create", async move {
                repo.create(asset)
                    .await
                    .map_err(|e| IngestError::repo("repository.create", Some(id), e))
            })
            .await;

        match created {
            Ok(asset) => {
                self.committed = true;
                self.service.hub.publish(HubEvent::AssetCreated {
                    asset_id: asset.id,
                    timestamp: asset.created_at.and_utc(),
                });
                self.service.signal_processing(asset.id);
                tracing::info!(
                    asset = %asset.id,
                    kind = %asset.content_kind,
                    provider = %asset.storage_provider,
                    parts = self.stored.len(),
                    "Ingest | asset created"
                );
                Ok(asset)
            }
            Err(e) => {
                tracing::error!(asset = %id, error = %e, "Ingest | metadata write failed after upload");
                Err(e)
            }
        }
    }

    /// Deletes everything stored so far and waits for it.
    pub async fn abort(mut self) {
        let paths = self.stored.drain(..).map(|d| d.path).collect();
        IngestService::cleanup_orphans(Arc::clone(&self.service.store), self.asset_id, paths).await;
    }
}

impl Drop for IngestSession {
    fn drop(&mut self) {
        if self.committed || self.stored.is_empty() {
            return;
        }
        let paths: Vec<String> = self.stored.drain(..).map(|d| d.path).collect();
        let store = Arc::clone(&self.service.store);
        let asset_id = self.asset_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(IngestService::cleanup_orphans(store, asset_id, paths));
            }
            Err(_) => {
                tracing::error!(asset = %asset_id, ?paths, "Ingest | no runtime to clean up orphaned objects");
            }
        }
    }
}
