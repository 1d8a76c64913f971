use std::io;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::TryStreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::entities::asset::{ContentKind, ProcessingState};
use crate::error::AppError;
use crate::routes::AppState;
use crate::services::ingest::{DeclaredMetadata, IngestSession};
use crate::services::storage::BodyStream;

#[derive(Serialize, utoipa::ToSchema)]
pub struct UploadResponse {
    id: Uuid,
    title: String,
    processing_state: ProcessingState,
    has_tracking_data: bool,
}

fn kind_for_field(name: &str) -> Option<ContentKind> {
    match name {
        "video_file" => Some(ContentKind::Video),
        "tracking_file" => Some(ContentKind::Tracking),
        "event_file" => Some(ContentKind::Event),
        _ => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or RFC 3339.
fn parse_match_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.naive_utc())
}

fn apply_text_field(meta: &mut DeclaredMetadata, name: &str, value: String) -> Result<(), AppError> {
    match name {
        "title" => meta.title = value,
        "description" => meta.description = non_empty(value),
        "match_id" => meta.match_id = non_empty(value),
        "home_team" => meta.home_team = non_empty(value),
        "away_team" => meta.away_team = non_empty(value),
        "competition" => meta.competition = non_empty(value),
        "season" => meta.season = non_empty(value),
        "resolution" => meta.resolution = non_empty(value),
        "match_date" => {
            meta.match_date = match non_empty(value) {
                Some(v) => Some(parse_match_date(&v).ok_or_else(|| {
                    AppError::BadRequest(format!("match_date '{}' is not a valid date", v))
                })?),
                None => None,
            }
        }
        "duration" => {
            meta.duration = match non_empty(value) {
                Some(v) => Some(v.parse::<f64>().map_err(|_| {
                    AppError::BadRequest(format!("duration '{}' is not a number", v))
                })?),
                None => None,
            }
        }
        other => tracing::debug!("Upload | ignoring unknown field '{}'", other),
    }
    Ok(())
}

// POST /assets
#[utoipa::path(
    post,
    path = "/assets",
    tag = "Upload",
    request_body(content = Vec<u8>, content_type = "multipart/form-data",
        description = "Text fields (title, description, match_id, match_date, home_team, away_team, competition, season, duration, resolution) followed by tracking_file, event_file and an optional video_file"),
    responses(
        (status = 201, description = "Asset stored and pending processing", body = UploadResponse),
        (status = 400, description = "Bad Request"),
        (status = 413, description = "Upload too large"),
        (status = 502, description = "Storage backend failed"),
        (status = 503, description = "Asset could not be recorded; retry the whole upload")
    )
)]
pub async fn upload_asset(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut metadata = DeclaredMetadata::default();
    let mut session: Option<IngestSession> = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };

        match kind_for_field(&name) {
            Some(kind) => {
                let file_name = field
                    .file_name()
                    .map(str::to_owned)
                    .ok_or_else(|| AppError::BadRequest(format!("{} must be a file", name)))?;
                if session.is_none() {
                    session = Some(state.ingest.begin(std::mem::take(&mut metadata))?);
                }
                if let Some(session) = session.as_mut() {
                    let body: BodyStream<'_> = Box::pin(field.map_err(io::Error::other));
                    session.add_part(kind, &file_name, body).await?;
                }
            }
            None => {
                if session.is_some() {
                    return Err(AppError::BadRequest(format!(
                        "field '{}' must be sent before any file",
                        name
                    )));
                }
                let value = field.text().await?;
                apply_text_field(&mut metadata, &name, value)?;
            }
        }
    }

    let session = session.ok_or_else(|| {
        AppError::BadRequest("tracking_file and event_file are required".to_string())
    })?;
    session.require_kinds(&[ContentKind::Tracking, ContentKind::Event])?;
    let asset = session.commit().await?;

    tracing::info!(
        "Upload | POST /assets | asset={} | kind={} | size={} | res=201",
        asset.id,
        asset.content_kind,
        asset.size
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            id: asset.id,
            title: asset.title,
            processing_state: asset.processing_state,
            has_tracking_data: asset.has_tracking_data,
        }),
    ))
}
