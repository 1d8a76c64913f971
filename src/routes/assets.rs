use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::asset::{ContentKind, ProcessingState, StorageProvider};
use crate::error::AppError;
use crate::pagination::{PaginatedResponse, Pagination};
use crate::routes::AppState;
use crate::services::repository::{Asset, AssetFilter};
use crate::services::storage::{content_type_for, TemporaryUrl};

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListAssetsQuery {
    pub limit: Option<i64>,
    pub offset: Option<u64>,
    pub match_id: Option<String>,
    /// Home or away team name.
    pub participant: Option<String>,
    /// First match day included (`YYYY-MM-DD`).
    pub from: Option<NaiveDate>,
    /// Last match day included (`YYYY-MM-DD`).
    pub to: Option<NaiveDate>,
    pub state: Option<ProcessingState>,
}

impl ListAssetsQuery {
    fn filter(&self) -> AssetFilter {
        AssetFilter {
            match_id: self.match_id.clone(),
            participant: self.participant.clone(),
            date_from: self.from.and_then(|d| d.and_hms_opt(0, 0, 0)),
            date_to: self.to.and_then(|d| d.and_hms_opt(23, 59, 59)),
            state: self.state,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AssetResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub content_kind: ContentKind,
    pub storage_provider: StorageProvider,
    pub storage_path: String,
    pub format: String,
    pub size: i64,
    pub duration: Option<f64>,
    pub resolution: Option<String>,
    pub processing_state: ProcessingState,
    pub failure_reason: Option<String>,
    pub match_id: Option<String>,
    pub match_date: Option<NaiveDateTime>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub competition: Option<String>,
    pub season: Option<String>,
    pub has_tracking_data: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<Asset> for AssetResponse {
    fn from(model: Asset) -> Self {
        Self {
            id: model.id,
            title: model.title,
            description: model.description,
            content_kind: model.content_kind,
            storage_provider: model.storage_provider,
            storage_path: model.storage_path,
            format: model.format,
            size: model.size,
            duration: model.duration,
            resolution: model.resolution,
            processing_state: model.processing_state,
            failure_reason: model.failure_reason,
            match_id: model.match_id,
            match_date: model.match_date,
            home_team: model.home_team,
            away_team: model.away_team,
            competition: model.competition,
            season: model.season,
            has_tracking_data: model.has_tracking_data,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StateUpdateRequest {
    pub state: ProcessingState,
    /// Recorded when moving to `failed`.
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StreamUrlResponse {
    pub url: String,
    /// Absent for links served by this API.
    pub expires_at: Option<DateTime<Utc>>,
}

// GET /assets
#[utoipa::path(
    get,
    path = "/assets",
    params(ListAssetsQuery),
    responses(
        (status = 200, description = "Live assets, newest first", body = PaginatedResponse<AssetResponse>),
        (status = 400, description = "Invalid filter")
    ),
    tag = "Assets"
)]
pub async fn list_assets(
    State(state): State<AppState>,
    Query(query): Query<ListAssetsQuery>,
) -> Result<Json<PaginatedResponse<AssetResponse>>, AppError> {
    let pagination = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    let (limit, offset) = pagination.resolve(state.limits.default_page_size, state.limits.max_page_size);
    let filter = query.filter();

    let assets = state.ingest.list(filter.clone(), limit as i64, offset).await?;
    let total = state.ingest.count(filter).await?;

    tracing::debug!("Assets | GET /assets | limit={} | offset={} | total={}", limit, offset, total);
    Ok(Json(PaginatedResponse::new(
        assets.into_iter().map(AssetResponse::from).collect(),
        total,
        limit,
        offset,
    )))
}

// GET /assets/{id}
#[utoipa::path(
    get,
    path = "/assets/{id}",
    params(("id" = Uuid, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "Asset metadata", body = AssetResponse),
        (status = 404, description = "Asset not found")
    ),
    tag = "Assets"
)]
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AssetResponse>, AppError> {
    let asset = state.ingest.get(id).await?;
    Ok(Json(asset.into()))
}

// DELETE /assets/{id}
#[utoipa::path(
    delete,
    path = "/assets/{id}",
    params(("id" = Uuid, Path, description = "Asset ID")),
    responses(
        (status = 204, description = "Asset deleted"),
        (status = 404, description = "Asset not found")
    ),
    tag = "Assets"
)]
pub async fn delete_asset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.ingest.delete(id).await?;
    tracing::info!("Assets | DELETE /assets/{} | res=204", id);
    Ok(StatusCode::NO_CONTENT)
}

// POST /assets/{id}/state
#[utoipa::path(
    post,
    path = "/assets/{id}/state",
    params(("id" = Uuid, Path, description = "Asset ID")),
    request_body = StateUpdateRequest,
    responses(
        (status = 200, description = "State changed", body = AssetResponse),
        (status = 404, description = "Asset not found"),
        (status = 422, description = "Transition not allowed from the current state")
    ),
    tag = "Assets"
)]
pub async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StateUpdateRequest>,
) -> Result<Json<AssetResponse>, AppError> {
    let asset = state
        .ingest
        .advance_state(id, payload.state, payload.reason)
        .await?;
    tracing::info!("Assets | POST /assets/{}/state | state={} | res=200", id, asset.processing_state);
    Ok(Json(asset.into()))
}

// GET /assets/{id}/stream
#[utoipa::path(
    get,
    path = "/assets/{id}/stream",
    params(("id" = Uuid, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "Time-limited playback URL", body = StreamUrlResponse),
        (status = 404, description = "Asset not found"),
        (status = 502, description = "Storage backend failed")
    ),
    tag = "Assets"
)]
pub async fn stream_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StreamUrlResponse>, AppError> {
    let response = match state.ingest.stream_url(id).await? {
        TemporaryUrl::Signed { url, expires_at } => StreamUrlResponse {
            url: url.into(),
            expires_at: Some(expires_at),
        },
        // file:// references never leave the server.
        TemporaryUrl::Local(_) => StreamUrlResponse {
            url: format!("/assets/{}/content", id),
            expires_at: None,
        },
    };
    Ok(Json(response))
}

// GET /assets/{id}/content
#[utoipa::path(
    get,
    path = "/assets/{id}/content",
    params(("id" = Uuid, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "Primary object bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Asset not found")
    ),
    tag = "Assets"
)]
pub async fn content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (asset, body) = state.ingest.open_content(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&asset.storage_path).to_string()),
            (header::CONTENT_LENGTH, asset.size.to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response())
}
