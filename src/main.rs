use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use match_asset_kit::config::Config;
use match_asset_kit::routes::{create_routes, ApiLimits, AppState};
use match_asset_kit::services::cleanup::CleanupService;
use match_asset_kit::services::hub::Hub;
use match_asset_kit::services::ingest::{IngestService, IngestSettings};
use match_asset_kit::services::repository::SeaOrmAssetRepository;
use match_asset_kit::services::storage;
use match_asset_kit::services::worker::{self, HttpDispatcher, Worker};

#[derive(Parser)]
#[command(name = "match-asset-kit", version, about = "Match asset ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply migrations and serve the HTTP API (default)
    Serve,
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,match_asset_kit=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let db = Database::connect(config.database_url.as_str()).await?;
    Migrator::up(&db, None).await?;
    tracing::info!("Database | migrations applied");

    if let Some(Command::Migrate) = cli.command {
        return Ok(());
    }

    let store = storage::from_config(&config.storage).await?;

    let repo = Arc::new(SeaOrmAssetRepository::new(db, config.default_page_size));
    let hub = Hub::new(config.subscriber_queue_capacity);
    let settings = IngestSettings {
        operation_timeout: config.operation_timeout,
        url_ttl: config.signed_url_ttl,
        max_page_size: config.max_page_size,
    };
    let mut ingest = IngestService::new(store.clone(), repo.clone(), hub, settings);

    let shutdown = CancellationToken::new();

    match &config.processing_api_url {
        Some(url) => {
            let (tx, rx) = mpsc::channel(worker::DEFAULT_QUEUE_CAPACITY);
            ingest = ingest.with_processing_queue(tx);
            let dispatcher = Arc::new(HttpDispatcher::new(url)?);
            let worker = Worker::new(ingest.clone(), dispatcher, rx).with_shutdown(shutdown.clone());
            tokio::spawn(worker.run());
        }
        None => tracing::warn!("Worker | PROCESSING_API_URL not set, assets stay pending until advanced via the API"),
    }

    let cleanup = CleanupService::new(repo, store, config.soft_delete_retention_days);
    tokio::spawn(cleanup.run_scheduler(shutdown.clone()));

    let app = create_routes(AppState {
        limits: ApiLimits::from(&config),
        ingest,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
