use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::services::repository::{AssetRepository, RepoError};
use crate::services::storage::ObjectStore;

const PURGE_BATCH: u64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    pub failed: usize,
}

/// Removes the stored bytes of assets that have been soft-deleted for
/// longer than the retention window. Rows stay, marked `purged_at`.
pub struct CleanupService {
    repo: Arc<dyn AssetRepository>,
    store: Arc<dyn ObjectStore>,
    retention: chrono::Duration,
}

impl CleanupService {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        store: Arc<dyn ObjectStore>,
        retention_days: i64,
    ) -> Self {
        Self {
            repo,
            store,
            retention: chrono::Duration::days(retention_days.max(0)),
        }
    }

    pub async fn run_scheduler(self, shutdown: CancellationToken) {
        tracing::info!(retention_days = self.retention.num_days(), "Cleanup Scheduler | started");
        let mut interval = tokio::time::interval(Duration::from_secs(86400));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.purge_expired().await {
                Ok(report) if report.purged + report.failed > 0 => {
                    tracing::info!(purged = report.purged, failed = report.failed, "Cleanup Scheduler | run finished");
                }
                Ok(_) => tracing::debug!("Cleanup Scheduler | nothing to purge"),
                Err(e) => tracing::error!(error = %e, "Cleanup Scheduler | run failed"),
            }
        }
    }

    pub async fn purge_expired(&self) -> Result<PurgeReport, RepoError> {
        self.purge_deleted_before(Utc::now().naive_utc() - self.retention).await
    }

    pub async fn purge_deleted_before(&self, threshold: NaiveDateTime) -> Result<PurgeReport, RepoError> {
        let candidates = self.repo.find_purgeable(threshold, PURGE_BATCH).await?;
        let mut report = PurgeReport::default();

        for asset in candidates {
            let mut clean = true;
            for key in asset.storage_keys() {
                if let Err(e) = self.store.delete(key).await {
                    tracing::warn!(asset = %asset.id, path = %key, error = %e, "Cleanup Scheduler | delete failed");
                    clean = false;
                }
            }
            // Left unmarked so the next run retries it.
            if !clean {
                report.failed += 1;
                continue;
            }
            self.repo.mark_purged(asset.id).await?;
            tracing::debug!(asset = %asset.id, "Cleanup Scheduler | purged");
            report.purged += 1;
        }
        Ok(report)
    }
}
