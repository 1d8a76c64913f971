use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::asset::{ProcessingState, StorageProvider};
use crate::services::ingest::{IngestError, IngestService};
use crate::services::repository::{Asset, AssetFilter};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("asset has no tracking data")]
    MissingTrackingData,

    #[error("processing api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("processing api answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Hands a pending asset to whatever does the actual analysis.
#[async_trait]
pub trait ProcessingDispatcher: Send + Sync {
    async fn dispatch(&self, asset: &Asset) -> Result<(), DispatchError>;
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ProcessMatchRequest {
    pub match_id: String,
    pub storage_provider: StorageProvider,
    pub tracking_data_path: String,
    pub event_data_path: Option<String>,
    pub video_path: Option<String>,
}

impl ProcessMatchRequest {
    pub fn for_asset(asset: &Asset) -> Result<Self, DispatchError> {
        let tracking_data_path = asset
            .tracking_path
            .clone()
            .ok_or(DispatchError::MissingTrackingData)?;
        let video_path = (asset.content_kind == crate::entities::asset::ContentKind::Video)
            .then(|| asset.storage_path.clone());

        Ok(Self {
            match_id: asset
                .match_id
                .clone()
                .unwrap_or_else(|| asset.id.to_string()),
            storage_provider: asset.storage_provider,
            tracking_data_path,
            event_data_path: asset.event_path.clone(),
            video_path,
        })
    }
}

/// POSTs `{base_url}/process-match` for each asset.
pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDispatcher {
    pub fn new(base_url: &str) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(DISPATCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/process-match", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ProcessingDispatcher for HttpDispatcher {
    async fn dispatch(&self, asset: &Asset) -> Result<(), DispatchError> {
        let request = ProcessMatchRequest::for_asset(asset)?;
        tracing::debug!(asset = %asset.id, endpoint = %self.endpoint, "Worker | dispatching");

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Drives pending assets through `processing` to a final state.
pub struct Worker {
    ingest: IngestService,
    dispatcher: Arc<dyn ProcessingDispatcher>,
    queue: mpsc::Receiver<Uuid>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        ingest: IngestService,
        dispatcher: Arc<dyn ProcessingDispatcher>,
        queue: mpsc::Receiver<Uuid>,
    ) -> Self {
        Self {
            ingest,
            dispatcher,
            queue,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn run(mut self) {
        tracing::info!("Worker | started");

        if let Err(e) = self.recover().await {
            tracing::error!(error = %e, "Worker | startup recovery failed");
        }

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.queue.recv() => next,
            };
            let Some(id) = next else { break };
            if let Err(e) = self.process(id).await {
                tracing::error!(asset = %id, error = %e, "Worker | processing failed");
            }
        }
        tracing::info!("Worker | stopped");
    }

    async fn ids_in_state(&self, state: ProcessingState) -> Result<Vec<Uuid>, IngestError> {
        let page = self.ingest.settings().max_page_size.max(1);
        let filter = AssetFilter {
            state: Some(state),
            ..Default::default()
        };
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self.ingest.list(filter.clone(), page as i64, offset).await?;
            let len = batch.len() as u64;
            ids.extend(batch.into_iter().map(|a| a.id));
            if len < page {
                return Ok(ids);
            }
            offset += len;
        }
    }

    /// Fails assets a previous run left in `processing` and picks up every
    /// asset still `pending`.
    pub async fn recover(&self) -> Result<(), IngestError> {
        let stuck = self.ids_in_state(ProcessingState::Processing).await?;
        for id in &stuck {
            self.ingest
                .advance_state(*id, ProcessingState::Failed, Some("interrupted".into()))
                .await?;
        }
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "Worker | marked interrupted assets as failed");
        }

        let pending = self.ids_in_state(ProcessingState::Pending).await?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Worker | resuming pending assets");
        }
        for id in pending {
            if let Err(e) = self.process(id).await {
                tracing::error!(asset = %id, error = %e, "Worker | processing failed");
            }
        }
        Ok(())
    }

    pub async fn process(&self, id: Uuid) -> Result<(), IngestError> {
        let asset = match self
            .ingest
            .advance_state(id, ProcessingState::Processing, None)
            .await
        {
            Ok(asset) => asset,
            // Deleted meanwhile, or another signal already picked it up.
            Err(IngestError::NotFound(_)) | Err(IngestError::InvalidTransition { .. }) => {
                tracing::debug!(asset = %id, "Worker | skipping, no longer pending");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let started = std::time::Instant::now();
        match self.dispatcher.dispatch(&asset).await {
            Ok(()) => {
                self.ingest
                    .advance_state(id, ProcessingState::Completed, None)
                    .await?;
                tracing::info!(asset = %id, took = ?started.elapsed(), "Worker | completed");
            }
            Err(e) => {
                tracing::warn!(asset = %id, error = %e, "Worker | dispatch failed");
                self.ingest
                    .advance_state(id, ProcessingState::Failed, Some(e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}
