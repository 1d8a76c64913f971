use sea_orm::{ConnectionTrait, Database};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
    let db = Database::connect(database_url).await?;

    for table in ["assets", "seaql_migrations"] {
        db.execute_unprepared(&format!("DROP TABLE IF EXISTS \"{}\" CASCADE;", table))
            .await?;
        tracing::info!("Reset | dropped table {}", table);
    }
    tracing::info!("Database reset successfully");
    Ok(())
}
