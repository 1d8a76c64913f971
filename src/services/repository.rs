//! Durable record store for asset metadata and processing state.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, DatabaseConnection,
    DbErr, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::entities::asset::{self, ProcessingState};

pub type Asset = asset::Model;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("asset not found: {0}")]
    NotFound(Uuid),

    #[error("asset id already exists: {0}")]
    DuplicateId(Uuid),

    #[error("storage path already in use: {0}")]
    StoragePathInUse(String),

    /// The row was not in the state the caller expected when it tried to
    /// move it (a concurrent transition won).
    #[error("asset {id} is {actual}, expected {expected}")]
    StateConflict {
        id: Uuid,
        expected: ProcessingState,
        actual: ProcessingState,
    },

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Read filters; unset fields do not constrain the query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetFilter {
    pub match_id: Option<String>,
    /// Matches either the home or the away team.
    pub participant: Option<String>,
    pub date_from: Option<NaiveDateTime>,
    pub date_to: Option<NaiveDateTime>,
    pub state: Option<ProcessingState>,
}

impl AssetFilter {
    fn condition(&self) -> Condition {
        let mut condition = Condition::all().add(asset::Column::DeletedAt.is_null());

        if let Some(match_id) = &self.match_id {
            condition = condition.add(asset::Column::MatchId.eq(match_id.as_str()));
        }
        if let Some(name) = &self.participant {
            condition = condition.add(
                Condition::any()
                    .add(asset::Column::HomeTeam.eq(name.as_str()))
                    .add(asset::Column::AwayTeam.eq(name.as_str())),
            );
        }
        if let Some(from) = self.date_from {
            condition = condition.add(asset::Column::MatchDate.gte(from));
        }
        if let Some(to) = self.date_to {
            condition = condition.add(asset::Column::MatchDate.lte(to));
        }
        if let Some(state) = self.state {
            condition = condition.add(asset::Column::ProcessingState.eq(state));
        }
        condition
    }
}

/// CRUD-plus-query access to assets. Every read excludes soft-deleted rows
/// unless the method name says otherwise.
#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Asset>>;

    async fn find_by_id_including_deleted(&self, id: Uuid) -> RepoResult<Option<Asset>>;

    /// A non-positive `limit` falls back to the repository's default page size.
    async fn find(&self, filter: &AssetFilter, limit: i64, offset: u64) -> RepoResult<Vec<Asset>>;

    async fn count(&self, filter: &AssetFilter) -> RepoResult<u64>;

    /// Fails with `DuplicateId` rather than overwriting an existing row.
    async fn create(&self, asset: Asset) -> RepoResult<Asset>;

    /// Rewrites the descriptive and lifecycle columns of a live row.
    async fn update(&self, asset: Asset) -> RepoResult<Asset>;

    /// Compare-and-set on `processing_state`; the legality of the edge is the
    /// caller's concern.
    async fn transition_state(
        &self,
        id: Uuid,
        from: ProcessingState,
        to: ProcessingState,
        failure_reason: Option<String>,
    ) -> RepoResult<Asset>;

    async fn soft_delete(&self, id: Uuid) -> RepoResult<()>;

    /// Soft-deleted rows older than `deleted_before` whose bytes are still stored.
    async fn find_purgeable(&self, deleted_before: NaiveDateTime, limit: u64) -> RepoResult<Vec<Asset>>;

    async fn mark_purged(&self, id: Uuid) -> RepoResult<()>;

    async fn find_all(&self, limit: i64, offset: u64) -> RepoResult<Vec<Asset>> {
        self.find(&AssetFilter::default(), limit, offset).await
    }

    async fn find_by_match_id(&self, match_id: &str, limit: i64, offset: u64) -> RepoResult<Vec<Asset>> {
        let filter = AssetFilter {
            match_id: Some(match_id.to_string()),
            ..Default::default()
        };
        self.find(&filter, limit, offset).await
    }

    async fn find_by_participant(&self, name: &str, limit: i64, offset: u64) -> RepoResult<Vec<Asset>> {
        let filter = AssetFilter {
            participant: Some(name.to_string()),
            ..Default::default()
        };
        self.find(&filter, limit, offset).await
    }

    async fn find_by_date_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        limit: i64,
        offset: u64,
    ) -> RepoResult<Vec<Asset>> {
        let filter = AssetFilter {
            date_from: Some(start),
            date_to: Some(end),
            ..Default::default()
        };
        self.find(&filter, limit, offset).await
    }

    async fn find_by_state(&self, state: ProcessingState, limit: i64, offset: u64) -> RepoResult<Vec<Asset>> {
        let filter = AssetFilter {
            state: Some(state),
            ..Default::default()
        };
        self.find(&filter, limit, offset).await
    }
}

/// `AssetRepository` over the `assets` table.
#[derive(Clone)]
pub struct SeaOrmAssetRepository {
    db: DatabaseConnection,
    default_page_size: u64,
}

impl SeaOrmAssetRepository {
    pub fn new(db: DatabaseConnection, default_page_size: u64) -> Self {
        Self {
            db,
            default_page_size: default_page_size.max(1),
        }
    }

    fn page_size(&self, limit: i64) -> u64 {
        if limit <= 0 {
            self.default_page_size
        } else {
            limit as u64
        }
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[async_trait]
impl AssetRepository for SeaOrmAssetRepository {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Asset>> {
        Ok(asset::Entity::find_by_id(id)
            .filter(asset::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?)
    }

    async fn find_by_id_including_deleted(&self, id: Uuid) -> RepoResult<Option<Asset>> {
        Ok(asset::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn find(&self, filter: &AssetFilter, limit: i64, offset: u64) -> RepoResult<Vec<Asset>> {
        Ok(asset::Entity::find()
            .filter(filter.condition())
            .order_by_desc(asset::Column::CreatedAt)
            .order_by_asc(asset::Column::Id)
            .limit(self.page_size(limit))
            .offset(offset)
            .all(&self.db)
            .await?)
    }

    async fn count(&self, filter: &AssetFilter) -> RepoResult<u64> {
        Ok(asset::Entity::find()
            .filter(filter.condition())
            .count(&self.db)
            .await?)
    }

    async fn create(&self, asset: Asset) -> RepoResult<Asset> {
        let txn = self.db.begin().await?;

        if asset::Entity::find_by_id(asset.id).one(&txn).await?.is_some() {
            return Err(RepoError::DuplicateId(asset.id));
        }
        let path_taken = asset::Entity::find()
            .filter(asset::Column::StoragePath.eq(asset.storage_path.as_str()))
            .filter(asset::Column::DeletedAt.is_null())
            .one(&txn)
            .await?
            .is_some();
        if path_taken {
            return Err(RepoError::StoragePathInUse(asset.storage_path));
        }

        let id = asset.id;
        let path = asset.storage_path.clone();
        let inserted = asset
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(|e| match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(msg)) if msg.contains("storage_path") => {
                    RepoError::StoragePathInUse(path.clone())
                }
                Some(SqlErr::UniqueConstraintViolation(_)) => RepoError::DuplicateId(id),
                _ => RepoError::Database(e),
            })?;

        txn.commit().await?;
        Ok(inserted)
    }

    async fn update(&self, mut asset: Asset) -> RepoResult<Asset> {
        let id = asset.id;
        asset.updated_at = now();

        let mut active = asset.into_active_model().reset_all();
        // Identity, creation time and deletion markers are never rewritten here.
        active.created_at = NotSet;
        active.deleted_at = NotSet;
        active.purged_at = NotSet;

        let result = asset::Entity::update(active)
            .filter(asset::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await;

        match result {
            Ok(model) => Ok(model),
            Err(DbErr::RecordNotUpdated) => Err(RepoError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition_state(
        &self,
        id: Uuid,
        from: ProcessingState,
        to: ProcessingState,
        failure_reason: Option<String>,
    ) -> RepoResult<Asset> {
        let result = asset::Entity::update_many()
            .col_expr(asset::Column::ProcessingState, Expr::value(to.into_value()))
            .col_expr(asset::Column::FailureReason, Expr::value(failure_reason))
            .col_expr(asset::Column::UpdatedAt, Expr::value(now()))
            .filter(asset::Column::Id.eq(id))
            .filter(asset::Column::ProcessingState.eq(from))
            .filter(asset::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await?;

        let current = self.find_by_id(id).await?.ok_or(RepoError::NotFound(id))?;
        if result.rows_affected == 0 {
            return Err(RepoError::StateConflict {
                id,
                expected: from,
                actual: current.processing_state,
            });
        }
        Ok(current)
    }

    async fn soft_delete(&self, id: Uuid) -> RepoResult<()> {
        let ts = now();
        let result = asset::Entity::update_many()
            .col_expr(asset::Column::DeletedAt, Expr::value(Some(ts)))
            .col_expr(asset::Column::UpdatedAt, Expr::value(ts))
            .filter(asset::Column::Id.eq(id))
            .filter(asset::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    async fn find_purgeable(&self, deleted_before: NaiveDateTime, limit: u64) -> RepoResult<Vec<Asset>> {
        Ok(asset::Entity::find()
            .filter(asset::Column::DeletedAt.is_not_null())
            .filter(asset::Column::DeletedAt.lt(deleted_before))
            .filter(asset::Column::PurgedAt.is_null())
            .order_by_asc(asset::Column::DeletedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn mark_purged(&self, id: Uuid) -> RepoResult<()> {
        let result = asset::Entity::update_many()
            .col_expr(asset::Column::PurgedAt, Expr::value(Some(now())))
            .filter(asset::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_db, sample_asset};
    use chrono::NaiveDate;

    async fn repo() -> SeaOrmAssetRepository {
        SeaOrmAssetRepository::new(memory_db().await, 10)
    }

    #[tokio::test]
    async fn create_then_find() {
        let repo = repo().await;
        let asset = sample_asset("matches/a.mp4");
        let created = repo.create(asset.clone()).await.unwrap();
        assert_eq!(created.id, asset.id);

        let found = repo.find_by_id(asset.id).await.unwrap().unwrap();
        assert_eq!(found.title, "Team A vs Team B");
        assert_eq!(found.processing_state, ProcessingState::Pending);
    }

    #[tokio::test]
    async fn duplicate_id_is_detected_not_overwritten() {
        let repo = repo().await;
        let asset = sample_asset("matches/a.mp4");
        repo.create(asset.clone()).await.unwrap();

        let mut clash = sample_asset("matches/b.mp4");
        clash.id = asset.id;
        clash.title = "Other".into();
        assert!(matches!(repo.create(clash).await, Err(RepoError::DuplicateId(_))));
        assert_eq!(
            repo.find_by_id(asset.id).await.unwrap().unwrap().title,
            "Team A vs Team B"
        );
    }

    #[tokio::test]
    async fn live_storage_paths_are_unique() {
        let repo = repo().await;
        repo.create(sample_asset("matches/a.mp4")).await.unwrap();
        assert!(matches!(
            repo.create(sample_asset("matches/a.mp4")).await,
            Err(RepoError::StoragePathInUse(_))
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_row_and_is_not_repeatable() {
        let repo = repo().await;
        let asset = repo.create(sample_asset("matches/a.mp4")).await.unwrap();

        repo.soft_delete(asset.id).await.unwrap();
        assert!(matches!(repo.soft_delete(asset.id).await, Err(RepoError::NotFound(_))));
        assert!(repo.find_by_id(asset.id).await.unwrap().is_none());
        assert!(repo.find_all(0, 0).await.unwrap().is_empty());
        assert_eq!(repo.count(&AssetFilter::default()).await.unwrap(), 0);

        let archived = repo.find_by_id_including_deleted(asset.id).await.unwrap().unwrap();
        assert!(archived.is_deleted());
    }

    #[tokio::test]
    async fn update_requires_live_row() {
        let repo = repo().await;
        let asset = repo.create(sample_asset("matches/a.mp4")).await.unwrap();

        let mut edited = asset.clone();
        edited.description = Some("second half only".into());
        let saved = repo.update(edited.clone()).await.unwrap();
        assert_eq!(saved.description.as_deref(), Some("second half only"));

        repo.soft_delete(asset.id).await.unwrap();
        assert!(matches!(repo.update(edited).await, Err(RepoError::NotFound(_))));
        assert!(matches!(
            repo.update(sample_asset("matches/z.mp4")).await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_positive_limit_uses_default_page() {
        let repo = repo().await;
        for i in 0..12 {
            repo.create(sample_asset(&format!("matches/{}.mp4", i))).await.unwrap();
        }
        assert_eq!(repo.find_all(0, 0).await.unwrap().len(), 10);
        assert_eq!(repo.find_all(-5, 0).await.unwrap().len(), 10);
        assert_eq!(repo.find_all(3, 0).await.unwrap().len(), 3);
        assert_eq!(repo.find_all(50, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn filters_by_match_participant_date_and_state() {
        let repo = repo().await;
        let mut derby = sample_asset("matches/derby.mp4");
        derby.match_id = Some("derby-2024".into());
        derby.home_team = Some("Rovers".into());
        derby.away_team = Some("United".into());
        derby.match_date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(15, 0, 0);
        repo.create(derby.clone()).await.unwrap();

        let mut other = sample_asset("matches/other.mp4");
        other.home_team = Some("City".into());
        other.away_team = Some("Athletic".into());
        other.match_date = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap().and_hms_opt(19, 0, 0);
        other.processing_state = ProcessingState::Failed;
        repo.create(other.clone()).await.unwrap();

        let by_match = repo.find_by_match_id("derby-2024", 0, 0).await.unwrap();
        assert_eq!(by_match.len(), 1);
        assert_eq!(by_match[0].id, derby.id);

        let away = repo.find_by_participant("United", 0, 0).await.unwrap();
        assert_eq!(away.len(), 1);
        assert_eq!(away[0].id, derby.id);

        let spring = repo
            .find_by_date_range(
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(0, 0, 0).unwrap(),
                0,
                0,
            )
            .await
            .unwrap();
        assert_eq!(spring.len(), 1);
        assert_eq!(spring[0].id, derby.id);

        let failed = repo.find_by_state(ProcessingState::Failed, 0, 0).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, other.id);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let repo = repo().await;
        let asset = repo.create(sample_asset("matches/a.mp4")).await.unwrap();

        let moved = repo
            .transition_state(asset.id, ProcessingState::Pending, ProcessingState::Processing, None)
            .await
            .unwrap();
        assert_eq!(moved.processing_state, ProcessingState::Processing);

        let stale = repo
            .transition_state(asset.id, ProcessingState::Pending, ProcessingState::Processing, None)
            .await;
        assert!(matches!(
            stale,
            Err(RepoError::StateConflict {
                actual: ProcessingState::Processing,
                ..
            })
        ));

        let failed = repo
            .transition_state(
                asset.id,
                ProcessingState::Processing,
                ProcessingState::Failed,
                Some("decoder crashed".into()),
            )
            .await
            .unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("decoder crashed"));
    }

    #[tokio::test]
    async fn purge_bookkeeping() {
        let repo = repo().await;
        let asset = repo.create(sample_asset("matches/a.mp4")).await.unwrap();
        repo.soft_delete(asset.id).await.unwrap();

        let future = now() + chrono::Duration::days(1);
        let purgeable = repo.find_purgeable(future, 10).await.unwrap();
        assert_eq!(purgeable.len(), 1);

        repo.mark_purged(asset.id).await.unwrap();
        assert!(repo.find_purgeable(future, 10).await.unwrap().is_empty());
        assert!(repo
            .find_purgeable(now() - chrono::Duration::days(1), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
