//! HTTP surface: routes, JSON error mapping, local blob serving.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::Settings,
    error::AppError,
    metadata::{MetadataStore, VideoRecord},
    storage::{
        BlobStore, LocalBlobStore, SelectedStore, StorageError, bounded, create_blob_store,
    },
    thumbnail::{FfmpegExtractor, FrameExtractor},
    uploads::{
        CompleteUpload, SignedUploadTicket, UploadLimits, UploadManager, UploadRequest,
        normalize_mime,
    },
    videos::{HealthReport, StorageSummary, VideoService},
};

/// Room for multipart boundaries and the text fields on top of the file.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadManager>,
    pub videos: Arc<VideoService>,
    /// Present only for the filesystem backend.
    pub local: Option<Arc<LocalBlobStore>>,
}

impl AppState {
    /// Wires the services over an already selected store.
    pub fn assemble(
        settings: &Settings,
        metadata: Arc<MetadataStore>,
        selected: SelectedStore,
        extractor: Arc<dyn FrameExtractor>,
    ) -> anyhow::Result<Self> {
        let uploads = UploadManager::new(
            metadata.clone(),
            selected.store.clone(),
            extractor,
            UploadLimits::from(settings),
        )
        .context("preparing placeholder thumbnail")?;
        let videos = VideoService::new(
            metadata,
            selected.store,
            settings.blob_timeout,
            settings.max_upload_bytes,
            settings.storage_quota,
            true,
        );
        Ok(Self {
            uploads: Arc::new(uploads),
            videos: Arc::new(videos),
            local: selected.local,
        })
    }

    /// Opens the metadata document, connects the configured store and uses
    /// `ffmpeg` for thumbnails.
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let db_path = settings.db_path.clone();
        let metadata = tokio::task::spawn_blocking(move || MetadataStore::open(db_path))
            .await
            .context("loading metadata document")?;
        let selected = create_blob_store(settings).await?;
        let extractor = Arc::new(FfmpegExtractor::new(&settings.ffmpeg_path));
        Self::assemble(settings, Arc::new(metadata), selected, extractor)
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(_) => StatusCode::BAD_GATEWAY,
            AppError::Persistence(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::Forbidden(_) => StatusCode::FORBIDDEN,
            StorageError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "storage request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let body_limit = state
        .uploads
        .limits()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/storage-info", get(storage_info))
        .route("/api/upload", post(upload_video))
        .route("/api/generate-upload-url", post(generate_upload_url))
        .route("/api/upload-complete", post(upload_complete))
        .route("/api/videos", get(list_videos))
        .route("/api/my-videos", get(list_videos))
        .route("/api/videos/{id}", get(get_video).delete(delete_video))
        .route("/api/blobs/{*key}", put(put_signed_blob))
        .route("/media/{*key}", get(serve_media))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    video: VideoRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResponse {
    success: bool,
    video_data: VideoRecord,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlRequest {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedBlobParams {
    content_type: String,
    expires: i64,
    signature: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.videos.health())
}

async fn storage_info(State(state): State<AppState>) -> Json<StorageSummary> {
    Json(state.videos.storage_summary())
}

async fn list_videos(State(state): State<AppState>) -> Json<Vec<VideoRecord>> {
    Json(state.videos.list_all())
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    Ok(Json(state.videos.get_by_id(&id).await?))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DeleteResponse>> {
    state.videos.delete_by_id(&id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: "Video deleted successfully".into(),
    }))
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let mut multipart =
        multipart.map_err(|err| ApiError::new(err.status(), err.body_text()))?;
    let mut request = UploadRequest {
        data: Bytes::new(),
        file_name: None,
        mime_type: String::new(),
        title: String::new(),
        description: None,
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("video") => {
                let file_name = field.file_name().map(str::to_owned);
                request.mime_type = field
                    .content_type()
                    .map(str::to_owned)
                    .or_else(|| {
                        file_name
                            .as_deref()
                            .and_then(|name| MimeGuess::from_path(name).first_raw())
                            .map(str::to_owned)
                    })
                    .unwrap_or_else(|| "application/octet-stream".into());
                request.file_name = file_name;
                request.data = field.bytes().await.map_err(multipart_error)?;
            }
            Some("title") => request.title = field.text().await.map_err(multipart_error)?,
            Some("description") => {
                request.description = Some(field.text().await.map_err(multipart_error)?)
            }
            _ => {}
        }
    }

    let video = state.uploads.submit_upload(request).await?;
    Ok(Json(UploadResponse {
        success: true,
        video,
    }))
}

async fn generate_upload_url(
    State(state): State<AppState>,
    payload: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> ApiResult<Json<SignedUploadTicket>> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let ticket = state
        .uploads
        .begin_upload(&payload.file_name, &payload.file_type)
        .await?;
    Ok(Json(ticket))
}

async fn upload_complete(
    State(state): State<AppState>,
    payload: Result<Json<CompleteUpload>, JsonRejection>,
) -> ApiResult<Json<CompleteResponse>> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let video_data = state.uploads.complete_upload(payload).await?;
    Ok(Json(CompleteResponse {
        success: true,
        video_data,
    }))
}

/// Target of the URLs the local store signs. Mirrors a bucket's signed PUT.
async fn put_signed_blob(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
    params: Result<Query<SignedBlobParams>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let local = state
        .local
        .as_ref()
        .ok_or_else(|| ApiError::not_found("signed uploads are handled by the bucket"))?;
    let Query(params) = params.map_err(|err| ApiError::bad_request(err.body_text()))?;

    local.verify_upload(
        &key,
        &params.content_type,
        params.expires,
        &params.signature,
        Utc::now().timestamp(),
    )?;
    if let Some(sent) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        if normalize_mime(sent) != normalize_mime(&params.content_type) {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "content type does not match the signed upload",
            ));
        }
    }

    let limits = state.uploads.limits();
    let size = body.len() as u64;
    if size > limits.max_upload_bytes {
        return Err(AppError::TooLarge {
            size,
            limit: limits.max_upload_bytes,
        }
        .into());
    }

    bounded(
        "signed upload",
        limits.blob_timeout,
        local.put(&key, body, &params.content_type),
    )
    .await?;
    tracing::info!(key = %key, size_bytes = size, "accepted signed upload");
    Ok(StatusCode::OK)
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
) -> ApiResult<Response> {
    let local = state
        .local
        .as_ref()
        .ok_or_else(|| ApiError::not_found("media is served by the bucket"))?;
    let (file, path) = local.open(&key).await?;
    Ok(stream_file(file, &path))
}

fn stream_file(file: tokio::fs::File, path: &Path) -> Response {
    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = body.into_response();
    if let Some(mime) = MimeGuess::from_path(path).first() {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    response
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), err.body_text())
}
