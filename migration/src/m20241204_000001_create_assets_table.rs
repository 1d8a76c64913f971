use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Assets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Assets::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Assets::Title).string().not_null())
                    .col(ColumnDef::new(Assets::Description).text())
                    .col(ColumnDef::new(Assets::ContentKind).string().not_null())
                    .col(ColumnDef::new(Assets::StorageProvider).string().not_null())
                    .col(ColumnDef::new(Assets::StoragePath).string().not_null().unique_key())
                    .col(ColumnDef::new(Assets::Format).string().not_null())
                    .col(ColumnDef::new(Assets::Size).big_integer().not_null())
                    .col(ColumnDef::new(Assets::Duration).double())
                    .col(ColumnDef::new(Assets::Resolution).string())
                    .col(ColumnDef::new(Assets::ProcessingState).string().not_null())
                    .col(ColumnDef::new(Assets::FailureReason).text())
                    .col(ColumnDef::new(Assets::MatchId).string())
                    .col(ColumnDef::new(Assets::MatchDate).timestamp())
                    .col(ColumnDef::new(Assets::HomeTeam).string())
                    .col(ColumnDef::new(Assets::AwayTeam).string())
                    .col(ColumnDef::new(Assets::Competition).string())
                    .col(ColumnDef::new(Assets::Season).string())
                    .col(
                        ColumnDef::new(Assets::HasTrackingData)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Assets::TrackingPath).string())
                    .col(ColumnDef::new(Assets::EventPath).string())
                    .col(ColumnDef::new(Assets::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Assets::UpdatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Assets::DeletedAt).timestamp())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_assets_match_id")
                    .table(Assets::Table)
                    .col(Assets::MatchId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_assets_processing_state")
                    .table(Assets::Table)
                    .col(Assets::ProcessingState)
                    .col(Assets::DeletedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Assets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Assets {
    Table,
    Id,
    Title,
    Description,
    ContentKind,
    StorageProvider,
    StoragePath,
    Format,
    Size,
    Duration,
    Resolution,
    ProcessingState,
    FailureReason,
    MatchId,
    MatchDate,
    HomeTeam,
    AwayTeam,
    Competition,
    Season,
    HasTrackingData,
    TrackingPath,
    EventPath,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
