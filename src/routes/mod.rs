mod assets;
mod home;
mod upload;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::services::ingest::IngestService;

// Define the OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        home::root,
        upload::upload_asset,
        assets::list_assets,
        assets::get_asset,
        assets::delete_asset,
        assets::update_state,
        assets::stream_url,
        assets::content,
        ws::ws_handler,
    ),
    components(
        schemas(
            upload::UploadResponse,
            assets::AssetResponse,
            assets::StateUpdateRequest,
            assets::StreamUrlResponse,
            crate::entities::asset::ProcessingState,
            crate::entities::asset::ContentKind,
            crate::entities::asset::StorageProvider,
        )
    ),
    tags(
        (name = "General", description = "General API information"),
        (name = "Upload", description = "Match asset ingestion"),
        (name = "Assets", description = "Asset metadata, processing state and playback"),
        (name = "Notifications", description = "Live asset events over WebSocket")
    ),
    info(
        title = "MatchAssetKit API",
        version = "0.1.0",
        description = "Ingestion, storage and live status of match video and tracking assets",
    )
)]
struct ApiDoc;

/// Request-facing bounds taken from configuration.
#[derive(Debug, Clone)]
pub struct ApiLimits {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub max_upload_bytes: usize,
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 100,
            max_upload_bytes: 500 * 1024 * 1024,
        }
    }
}

impl From<&Config> for ApiLimits {
    fn from(config: &Config) -> Self {
        Self {
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub limits: ApiLimits,
}

pub fn create_routes(state: AppState) -> Router {
    // Swagger UI (stateless)
    let swagger_router: Router = SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDoc::openapi())
        .into();

    let upload_limit = DefaultBodyLimit::max(state.limits.max_upload_bytes);

    let app_routes = Router::new()
        .route("/", get(home::root))
        .route(
            "/assets",
            post(upload::upload_asset)
                .layer(upload_limit)
                .get(assets::list_assets),
        )
        .route("/assets/{id}", get(assets::get_asset).delete(assets::delete_asset))
        .route("/assets/{id}/state", post(assets::update_state))
        .route("/assets/{id}/stream", get(assets::stream_url))
        .route("/assets/{id}/content", get(assets::content))
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    Router::new()
        .merge(swagger_router)
        .merge(app_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::test_support::{file_count, service_with};

    const BOUNDARY: &str = "match-asset-boundary";

    struct Form {
        body: Vec<u8>,
    }

    impl Form {
        fn new() -> Self {
            Self { body: Vec::new() }
        }

        fn text(mut self, name: &str, value: &str) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
            self
        }

        fn file(mut self, name: &str, file_name: &str, data: &[u8]) -> Self {
            self.body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, name, file_name
                )
                .as_bytes(),
            );
            self.body.extend_from_slice(data);
            self.body.extend_from_slice(b"\r\n");
            self
        }

        fn request(mut self) -> Request<Body> {
            self.body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
            Request::post("/assets")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(self.body))
                .unwrap()
        }
    }

    fn match_form() -> Form {
        Form::new()
            .text("title", "Rovers vs United")
            .text("home_team", "Rovers")
            .text("away_team", "United")
            .text("match_date", "2024-03-09")
            .file("video_file", "game.mp4", b"video")
            .file("tracking_file", "tracking.gzip", b"tracking")
            .file("event_file", "events.json", b"[]")
    }

    async fn json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn app(root: &std::path::Path) -> Router {
        let (ingest, _db) = service_with(root).await;
        create_routes(AppState {
            ingest,
            limits: ApiLimits::default(),
        })
    }

    #[tokio::test]
    async fn home_page_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&page);
        assert!(page.contains("match-asset-kit"));
        assert!(page.contains("/swagger-ui/"));
    }

    #[tokio::test]
    async fn upload_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let created = app.clone().oneshot(match_form().request()).await.unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = json(created).await;
        assert_eq!(created["processing_state"], "pending");
        assert_eq!(created["has_tracking_data"], true);
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = app
            .clone()
            .oneshot(Request::get(format!("/assets/{}", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        let fetched = json(fetched).await;
        assert_eq!(fetched["home_team"], "Rovers");
        assert_eq!(fetched["content_kind"], "video");

        let listed = app
            .clone()
            .oneshot(
                Request::get("/assets?participant=United&from=2024-03-01&to=2024-03-31")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = json(listed).await;
        assert_eq!(listed["total_items"], 1);
        assert_eq!(listed["limit"], 10);
        assert_eq!(listed["data"][0]["id"], id.as_str());

        let stream = app
            .clone()
            .oneshot(Request::get(format!("/assets/{}/stream", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stream = json(stream).await;
        assert_eq!(stream["url"], format!("/assets/{}/content", id));

        let content = app
            .oneshot(Request::get(format!("/assets/{}/content", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(content.status(), StatusCode::OK);
        assert_eq!(content.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = to_bytes(content.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"video");
    }

    #[tokio::test]
    async fn missing_event_file_is_rejected_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let form = Form::new()
            .text("title", "Rovers vs United")
            .file("tracking_file", "tracking.gzip", b"tracking");
        let response = app.oneshot(form.request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "validation_error");

        for _ in 0..50 {
            if file_count(dir.path()) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn bad_tracking_file_after_video_rolls_back_the_video() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let form = Form::new()
            .text("title", "Rovers vs United")
            .file("video_file", "game.mp4", &[7u8; 64 * 1024])
            .file("tracking_file", "positions.exe", b"tracking")
            .file("event_file", "events.json", b"[]");
        let response = app.oneshot(form.request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "validation_error");

        // The rejected part is never written; the video already stored is
        // removed in the background.
        for _ in 0..50 {
            if file_count(dir.path()) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn text_after_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let form = Form::new()
            .text("title", "Rovers vs United")
            .file("tracking_file", "tracking.gzip", b"tracking")
            .text("season", "2024");
        let response = app(dir.path()).await.oneshot(form.request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn state_changes_follow_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let created = json(app.clone().oneshot(match_form().request()).await.unwrap()).await;
        let id = created["id"].as_str().unwrap().to_string();

        let set_state = |body: &'static str| {
            Request::post(format!("/assets/{}/state", id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let skipped = app.clone().oneshot(set_state(r#"{"state":"completed"}"#)).await.unwrap();
        assert_eq!(skipped.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(skipped).await["code"], "invalid_transition");

        let started = app.clone().oneshot(set_state(r#"{"state":"processing"}"#)).await.unwrap();
        assert_eq!(started.status(), StatusCode::OK);

        let failed = app
            .oneshot(set_state(r#"{"state":"failed","reason":"corrupt tracking file"}"#))
            .await
            .unwrap();
        let failed = json(failed).await;
        assert_eq!(failed["processing_state"], "failed");
        assert_eq!(failed["failure_reason"], "corrupt tracking file");
    }

    #[tokio::test]
    async fn delete_is_soft_and_not_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let created = json(app.clone().oneshot(match_form().request()).await.unwrap()).await;
        let id = created["id"].as_str().unwrap().to_string();

        let delete = || Request::delete(format!("/assets/{}", id)).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(delete()).await.unwrap().status(), StatusCode::NO_CONTENT);
        assert_eq!(app.clone().oneshot(delete()).await.unwrap().status(), StatusCode::NOT_FOUND);

        let stream = app
            .oneshot(Request::get(format!("/assets/{}/stream", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::NOT_FOUND);
        // Bytes stay until the retention cleanup runs.
        assert_eq!(file_count(dir.path()), 3);
    }

    #[tokio::test]
    async fn unknown_asset_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(
                Request::get(format!("/assets/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["code"], "not_found");
    }
}
