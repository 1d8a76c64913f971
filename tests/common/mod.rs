use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use match_asset_kit::services::hub::Hub;
use match_asset_kit::services::ingest::{IngestService, IngestSettings};
use match_asset_kit::services::repository::SeaOrmAssetRepository;
use match_asset_kit::services::storage::{BodyStream, LocalStore};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub struct Harness {
    pub service: IngestService,
    pub db: DatabaseConnection,
    pub hub: Hub,
}

pub async fn harness(root: &Path) -> Harness {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let store = Arc::new(LocalStore::new(root).await.unwrap());
    let repo = Arc::new(SeaOrmAssetRepository::new(db.clone(), 10));
    let hub = Hub::new(32);
    let service = IngestService::new(store, repo, hub.clone(), IngestSettings::default());
    Harness { service, db, hub }
}

pub fn body(data: &'static [u8]) -> BodyStream<'static> {
    Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(
        Bytes::from_static(data),
    )]))
}

pub fn file_count(root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                file_count(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Waits for background orphan cleanup to empty `root`.
pub async fn wait_until_empty(root: &Path) -> usize {
    for _ in 0..100 {
        if file_count(root) == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    file_count(root)
}
