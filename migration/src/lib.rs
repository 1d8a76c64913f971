pub use sea_orm_migration::prelude::*;

mod m20241204_000001_create_assets_table;
mod m20241211_000002_add_asset_purged_at;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241204_000001_create_assets_table::Migration),
            Box::new(m20241211_000002_add_asset_purged_at::Migration),
        ]
    }
}
