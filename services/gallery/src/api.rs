use crate::config::ApiConfig;
use crate::error::GalleryError;
use crate::ingest::IngestService;
use crate::record::{ImageId, ImageRecord};
use crate::record_store::RecordStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub ingest: Arc<IngestService>,
}

/// Router settings that do not come from [`ApiConfig`]
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Largest accepted request body
    pub max_upload_bytes: usize,
    /// Directory served under `/uploads`, when payloads are stored locally
    pub upload_dir: Option<PathBuf>,
}

/// Query parameters for a single record
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageRecord>,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub image: ImageRecord,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub image: ImageRecord,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, options: &RouterOptions) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/images", get(list_images))
        .route("/image", get(get_image))
        .route("/upload", post(upload_image))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes));

    if let Some(dir) = &options.upload_dir {
        router = router.nest_service("/uploads", ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gallery-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Every record known to this instance
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
) -> Result<Json<ImageListResponse>, GalleryError> {
    let images = state.records.list().await?;
    Ok(Json(ImageListResponse { images }))
}

/// One record by id
#[instrument(skip(state, query))]
async fn get_image(
    State(state): State<AppState>,
    query: Option<Query<ImageQuery>>,
) -> Result<Json<ImageResponse>, GalleryError> {
    let raw = query
        .and_then(|Query(q)| q.id)
        .ok_or_else(|| GalleryError::validation("Missing id query parameter", "MISSING_ID"))?;
    let id = ImageId::parse(&raw)?;

    match state.records.get(&id).await? {
        Some(image) => Ok(Json(ImageResponse { image })),
        None => Err(GalleryError::NotFound),
    }
}

/// Accept a multipart upload, persist it, then announce it
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), GalleryError> {
    let result = accept_upload(&state, multipart).await;

    if let Some(reason) = result.as_ref().err().and_then(GalleryError::rejection_reason) {
        metrics::counter!("gallery.uploads.rejected", "reason" => reason).increment(1);
    }

    result
}

async fn accept_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), GalleryError> {
    let mut multipart = multipart
        .map_err(|e| GalleryError::validation(e.body_text(), "INVALID_MULTIPART"))?;

    let (filename, bytes) = read_file_part(&mut multipart)
        .await?
        .ok_or_else(|| GalleryError::validation("No file uploaded", "NO_FILE"))?;

    let image = state.ingest.ingest(bytes, &filename).await?;

    // Publishing runs detached; the response never waits on the channel
    state.ingest.announce(&image);

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message: "Image uploaded successfully",
            image,
        }),
    ))
}

/// First part that carries a filename, with its contents
async fn read_file_part(
    multipart: &mut Multipart,
) -> Result<Option<(String, Bytes)>, GalleryError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(Some((filename, bytes)));
    }
    Ok(None)
}

fn multipart_error(err: MultipartError) -> GalleryError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return GalleryError::PayloadTooLarge;
    }
    warn!(error = %err, "Malformed multipart body");
    GalleryError::validation(err.body_text(), "INVALID_MULTIPART")
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    router: Router,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server error")?;

    info!("Gallery API server stopped");
    Ok(())
}
