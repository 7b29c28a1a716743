//! HTTP boundary for the sticker backend.
//!
//! Handlers translate wire requests into component calls and internal error
//! kinds into the JSON error envelope. Identity arrives pre-authenticated in
//! the `x-user-id` header; real authentication sits in front of this
//! service.

use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Path, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::fingerprint::{canonical_selection_hash, valid_rect};
use crate::generator::{GenerateJob, StickerGenerator};
use crate::job_queue::ContextJobQueue;
use crate::quota::{Bucket, QuotaService};
use crate::scheduler::{SessionRun, WindowScheduler};
use crate::session_store::{NavAction, SessionStore};
use crate::sticker_cache::{project_stickers, ImageRegionCapture, ProbeResult, StickerCache};
use crate::store::MemoryStore;
use crate::types::*;

const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const MAX_REGIONS: usize = 8;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub quota: Arc<QuotaService>,
    pub cache: Arc<StickerCache>,
    pub generator: Arc<StickerGenerator>,
    pub sessions: Arc<SessionStore>,
    pub scheduler: Arc<WindowScheduler>,
    pub jobs: Arc<ContextJobQueue>,
    pub config: AppConfig,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = match &self {
            ApiError::Validation { field: Some(field), .. } => Some(json!({ "field": field })),
            ApiError::QuotaExceeded { snapshot, .. } => Some(json!({
                "used": snapshot.used,
                "limit": snapshot.limit,
                "resetAt": snapshot.reset_at_ms,
            })),
            ApiError::SessionExists { session_id } => Some(json!({ "sessionId": session_id })),
            _ => None,
        };
        let body = json!({
            "ok": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": details,
            }
        });
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplainPageBody {
    course_id: String,
    file_id: String,
    page: u32,
    pdf_type: String,
    locale: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultipartPayload {
    #[serde(flatten)]
    base: ExplainPageBody,
    effective_mode: String,
    selected_image_regions: Vec<SelectedRegion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPatchBody {
    current_page: u32,
    action: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionPatchBody {
    version_index: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StickerDto {
    id: String,
    #[serde(rename = "type")]
    kind: StickerKind,
    page: u32,
    anchor: AnchorDto,
    parent_id: Option<String>,
    content_markdown: String,
    folded: bool,
    depth: u32,
    created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchorDto {
    text_snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rect: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_full_page: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchors: Option<Vec<AnchorPart>>,
}

fn sticker_dto(sticker: &Sticker) -> StickerDto {
    StickerDto {
        id: sticker.id.clone(),
        kind: sticker.kind,
        page: sticker.page,
        anchor: AnchorDto {
            text_snippet: sticker.anchor.text_snippet.clone(),
            rect: sticker.anchor.rect,
            is_full_page: sticker.anchor.is_full_page,
            anchors: sticker.anchor.anchors.clone(),
        },
        parent_id: sticker.parent_id.clone(),
        content_markdown: sticker.content_markdown.clone(),
        folded: sticker.folded,
        depth: sticker.depth,
        created_at: sticker.created_at_ms,
    }
}

fn session_snapshot(session: &WindowSession) -> serde_json::Value {
    json!({
        "sessionId": session.id,
        "state": session.state,
        "pdfType": session.pdf_kind,
        "windowStart": session.window_start,
        "windowEnd": session.window_end,
        "currentPage": session.current_page,
        "pagesCompleted": session.pages_completed,
        "pagesInProgress": session.pages_in_progress,
        "pagesFailed": session.pages_failed,
        "progressPercent": session.progress_percent(),
    })
}

// ── Request helpers ──────────────────────────────────────────────────────

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError::Unauthorized)
}

/// Resolve the file and run the shared request checks.
fn resolve_file(
    state: &AppState,
    user_id: &str,
    body: &ExplainPageBody,
) -> Result<(FileRecord, String, Locale, PdfType), ApiError> {
    let locale = Locale::parse(&body.locale)
        .ok_or_else(|| ApiError::field("unsupported locale", "locale"))?;
    let pdf_type = PdfType::parse(&body.pdf_type)
        .ok_or_else(|| ApiError::field("unsupported pdfType", "pdfType"))?;

    let file = state.store.file(&body.file_id).ok_or(ApiError::NotFound)?;
    // Ownership failures read as not-found
    if file.owner_user_id != user_id {
        return Err(ApiError::NotFound);
    }
    if file.course_id != body.course_id {
        return Err(ApiError::field("file does not belong to course", "courseId"));
    }
    if file.is_scanned {
        return Err(ApiError::FileIsScanned);
    }
    if body.page == 0 || body.page > file.page_count {
        return Err(ApiError::PageOutOfRange {
            page: body.page,
            total: file.page_count,
        });
    }
    let pdf_hash = file
        .content_hash
        .clone()
        .ok_or_else(|| ApiError::field("file has not finished ingest", "fileId"))?;
    Ok((file, pdf_hash, locale, pdf_type))
}

/// First sighting of a PDF by any user seeds the context pipeline: a scope
/// row immediately, and an extraction job when the hash is still unmined.
fn observe_pdf(state: &AppState, user_id: &str, file: &FileRecord, pdf_hash: &str) {
    state.store.ensure_scope(UserScope {
        user_id: user_id.to_string(),
        course_id: file.course_id.clone(),
        file_id: file.id.clone(),
        pdf_hash: pdf_hash.to_string(),
    });
    if state.store.entry_count_for_hash(pdf_hash) > 0
        || state.store.job_for_hash(pdf_hash).is_some()
    {
        return;
    }
    match state.quota.deduct(user_id, Bucket::Extractions, 1) {
        Ok(_) => {
            if state
                .jobs
                .enqueue(pdf_hash, &file.id, user_id, file.page_count)
                .is_none()
            {
                // Lost the race to another request; give the unit back
                state.quota.refund(user_id, Bucket::Extractions, 1);
            }
        }
        Err(snapshot) => {
            warn!(
                "extraction not queued for {}: user {} at {}/{}",
                pdf_hash, user_id, snapshot.used, snapshot.limit
            );
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "marginalia",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /explain-page. JSON requests carry text-only work (single or
/// window); multipart requests carry selected-image regions plus their JPEG
/// crops.
async fn explain_page_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::validation(format!("malformed multipart body: {}", e)))?;
        return explain_with_images(state, user_id, multipart).await;
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_UPLOAD_BYTES)
        .await
        .map_err(|e| ApiError::validation(format!("unreadable body: {}", e)))?;
    let body: ExplainPageBody = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::validation(format!("malformed request body: {}", e)))?;

    let (file, pdf_hash, locale, pdf_type) = resolve_file(&state, &user_id, &body)?;
    observe_pdf(&state, &user_id, &file, &pdf_hash);

    match body.mode.as_deref().unwrap_or("single") {
        "window" => start_window_session(&state, &user_id, &file, &body, locale, pdf_type),
        "single" => {
            let fingerprint = Fingerprint {
                pdf_hash,
                page: body.page,
                locale,
                mode: EffectiveMode::TextOnly,
                selection_hash: None,
            };
            serve_single(&state, &user_id, &file, &body, fingerprint, pdf_type, vec![]).await
        }
        other => Err(ApiError::field(format!("unsupported mode '{}'", other), "mode")),
    }
}

/// Multipart leg: `payload` JSON plus `image_0..image_7` JPEG parts.
async fn explain_with_images(
    state: AppState,
    user_id: String,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut payload: Option<MultipartPayload> = None;
    let mut images: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut total_bytes = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("multipart read failed: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::validation(format!("multipart part failed: {}", e)))?;
        total_bytes += data.len();
        if total_bytes > MAX_UPLOAD_BYTES {
            return Err(ApiError::validation("upload exceeds the 5 MB limit"));
        }
        if name == "payload" {
            payload = Some(
                serde_json::from_slice(&data)
                    .map_err(|e| ApiError::field(format!("malformed payload: {}", e), "payload"))?,
            );
        } else if let Some(index) = name.strip_prefix("image_").and_then(|i| i.parse().ok()) {
            images.push((index, data.to_vec()));
        }
    }

    let payload = payload.ok_or_else(|| ApiError::field("missing payload part", "payload"))?;
    if payload.effective_mode != "with_selected_images" {
        return Err(ApiError::field("unsupported effectiveMode", "effectiveMode"));
    }
    let regions = &payload.selected_image_regions;
    if regions.is_empty() || regions.len() > MAX_REGIONS {
        return Err(ApiError::field(
            format!("between 1 and {} regions required", MAX_REGIONS),
            "selectedImageRegions",
        ));
    }
    for region in regions {
        if !valid_rect(&region.rect) {
            return Err(ApiError::field("invalid rect", "selectedImageRegions"));
        }
    }
    if images.len() != regions.len() {
        return Err(ApiError::validation(format!(
            "{} regions but {} image parts",
            regions.len(),
            images.len()
        )));
    }
    images.sort_by_key(|(index, _)| *index);

    let (file, pdf_hash, locale, pdf_type) = resolve_file(&state, &user_id, &payload.base)?;
    observe_pdf(&state, &user_id, &file, &pdf_hash);

    let selection_hash = canonical_selection_hash(
        payload.base.page,
        EffectiveMode::WithSelectedImages,
        locale,
        regions,
    );
    let fingerprint = Fingerprint {
        pdf_hash,
        page: payload.base.page,
        locale,
        mode: EffectiveMode::WithSelectedImages,
        selection_hash: Some(selection_hash),
    };
    let captures: Vec<ImageRegionCapture> = regions
        .iter()
        .zip(images)
        .map(|(region, (_, jpeg_bytes))| ImageRegionCapture {
            region: *region,
            jpeg_bytes,
        })
        .collect();

    serve_single(&state, &user_id, &file, &payload.base, fingerprint, pdf_type, captures).await
}

/// Shared single-mode flow: consult quota, probe the cache, and either
/// serve, point at the in-flight generation, or claim a fresh one.
async fn serve_single(
    state: &AppState,
    user_id: &str,
    file: &FileRecord,
    body: &ExplainPageBody,
    fingerprint: Fingerprint,
    pdf_type: PdfType,
    captures: Vec<ImageRegionCapture>,
) -> Result<Response, ApiError> {
    let quota_err = |snapshot| ApiError::QuotaExceeded {
        bucket: Bucket::AutoExplain.name().to_string(),
        snapshot,
    };
    let snapshot = state.quota.check(user_id, Bucket::AutoExplain);
    if !snapshot.allowed() {
        return Err(quota_err(snapshot));
    }

    match state.cache.probe(&fingerprint, user_id) {
        ProbeResult::Ready { generation } => {
            // Image-mode hits always charge; text-only hits charge unless
            // the user already holds local copies for this page.
            let already_local = fingerprint.mode == EffectiveMode::TextOnly
                && state
                    .store
                    .has_auto_stickers(user_id, &file.id, fingerprint.page);
            if !already_local {
                state
                    .quota
                    .deduct(user_id, Bucket::AutoExplain, 1)
                    .map_err(quota_err)?;
                let copies = project_stickers(&generation, user_id, &file.course_id, &file.id);
                state.store.insert_stickers(&copies);
            }
            state.cache.record_latency_sample(
                Some(&fingerprint.pdf_hash),
                fingerprint.page,
                fingerprint.locale,
                fingerprint.mode,
                0,
                true,
            );
            let stickers: Vec<StickerDto> = generation.stickers.iter().map(sticker_dto).collect();
            Ok((
                StatusCode::OK,
                Json(json!({ "stickers": stickers, "cacheHit": true })),
            )
                .into_response())
        }
        ProbeResult::Generating { generation_id } => {
            state
                .quota
                .deduct(user_id, Bucket::AutoExplain, 1)
                .map_err(quota_err)?;
            Ok(accepted_generation(state, &generation_id))
        }
        ProbeResult::NotFound => {
            state
                .quota
                .deduct(user_id, Bucket::AutoExplain, 1)
                .map_err(quota_err)?;
            let claim = state
                .cache
                .try_start(&fingerprint, user_id, 1, &captures);
            if claim.started {
                let job = GenerateJob {
                    generation_id: claim.generation_id.clone(),
                    user_id: user_id.to_string(),
                    course_id: file.course_id.clone(),
                    file: file.clone(),
                    page: fingerprint.page,
                    pdf_kind: pdf_type.kind(),
                    locale: fingerprint.locale,
                    mode: fingerprint.mode,
                    images: captures,
                    question: body.question.clone(),
                    file_bytes: None,
                };
                let generator = Arc::clone(&state.generator);
                tokio::spawn(async move {
                    generator.run(job).await;
                });
            }
            Ok(accepted_generation(state, &claim.generation_id))
        }
    }
}

fn accepted_generation(state: &AppState, generation_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "generationId": generation_id,
            "pollIntervalMs": state.config.poll_interval.as_millis() as u64,
        })),
    )
        .into_response()
}

fn start_window_session(
    state: &AppState,
    user_id: &str,
    file: &FileRecord,
    body: &ExplainPageBody,
    locale: Locale,
    pdf_type: PdfType,
) -> Result<Response, ApiError> {
    let snapshot = state.quota.check(user_id, Bucket::AutoExplain);
    if !snapshot.allowed() {
        return Err(ApiError::QuotaExceeded {
            bucket: Bucket::AutoExplain.name().to_string(),
            snapshot,
        });
    }

    let kind = pdf_type.kind();
    let session = state.sessions.start(user_id, file, body.page, kind, locale)?;
    state.scheduler.spawn(SessionRun {
        session_id: session.id.clone(),
        user_id: user_id.to_string(),
        course_id: file.course_id.clone(),
        locale,
        file: file.clone(),
    });
    info!(
        "window session {} accepted for user {} ({:?})",
        session.id, user_id, kind
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "sessionId": session.id,
            "windowStart": session.window_start,
            "windowEnd": session.window_end,
            "pdfType": kind,
        })),
    )
        .into_response())
}

async fn generation_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(generation_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let record = state
        .cache
        .get_status(&generation_id)
        .ok_or(ApiError::NotFound)?;
    // Shared records are visible only through a readable pdf-hash
    if !state
        .store
        .user_can_read_hash(&user_id, &record.fingerprint.pdf_hash)
    {
        return Err(ApiError::NotFound);
    }
    let response = match record.state {
        GenerationState::Generating => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "generating" })),
        )
            .into_response(),
        GenerationState::Ready => {
            let stickers: Vec<StickerDto> = record.stickers.iter().map(sticker_dto).collect();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ready",
                    "stickers": stickers,
                    "generationTimeMs": record.latency_ms,
                })),
            )
                .into_response()
        }
        GenerationState::Failed => (
            StatusCode::OK,
            Json(json!({ "status": "failed", "error": record.error })),
        )
            .into_response(),
    };
    Ok(response)
}

async fn session_get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let session = state.sessions.get(&session_id).ok_or(ApiError::NotFound)?;
    if session.user_id != user_id {
        return Err(ApiError::NotFound);
    }
    Ok(Json(session_snapshot(&session)))
}

async fn session_patch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<SessionPatchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let session = state.sessions.get(&session_id).ok_or(ApiError::NotFound)?;
    if session.user_id != user_id {
        return Err(ApiError::NotFound);
    }
    let action = NavAction::parse(&body.action)
        .ok_or_else(|| ApiError::field("unsupported action", "action"))?;
    if body.current_page == 0 || body.current_page > session.total_pages {
        return Err(ApiError::PageOutOfRange {
            page: body.current_page,
            total: session.total_pages,
        });
    }

    let outcome = state
        .sessions
        .update(&session_id, body.current_page, action)?;

    // The previous task may have drained the old window and exited; make
    // sure someone picks up the new pages.
    if outcome.action != NavAction::Cancel {
        if let Some(file) = state.store.file(&session.file_id) {
            state.scheduler.spawn(SessionRun {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                course_id: file.course_id.clone(),
                locale: session.locale,
                file,
            });
        }
    }

    Ok(Json(json!({
        "action": outcome.action.as_str(),
        "windowStart": outcome.session.window_start,
        "windowEnd": outcome.session.window_end,
        "canceledPages": outcome.canceled_pages,
        "newPages": outcome.new_pages,
    })))
}

async fn session_delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let session = state.sessions.get(&session_id).ok_or(ApiError::NotFound)?;
    if session.user_id != user_id {
        return Err(ApiError::NotFound);
    }
    let session = state.sessions.cancel(&session_id)?;
    Ok(Json(session_snapshot(&session)))
}

async fn sticker_refresh_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sticker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let sticker = state.generator.refresh_sticker(&user_id, &sticker_id).await?;
    Ok(Json(json!({
        "sticker": sticker_dto(&sticker),
        "activeVersion": sticker.active_version,
        "versionCount": sticker.versions.len(),
    })))
}

async fn sticker_versions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sticker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let sticker = state
        .store
        .sticker(&sticker_id)
        .filter(|s| s.user_id == user_id)
        .ok_or(ApiError::NotFound)?;
    let versions: Vec<serde_json::Value> = sticker
        .versions
        .iter()
        .enumerate()
        .map(|(index, version)| {
            json!({
                "index": index,
                "contentMarkdown": version.content_markdown,
                "createdAt": version.created_at_ms,
                "active": index == sticker.active_version,
            })
        })
        .collect();
    Ok(Json(json!({ "stickerId": sticker.id, "versions": versions })))
}

async fn sticker_version_patch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sticker_id): Path<String>,
    Json(body): Json<VersionPatchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let sticker = state
        .store
        .sticker(&sticker_id)
        .filter(|s| s.user_id == user_id)
        .ok_or(ApiError::NotFound)?;
    if body.version_index >= sticker.versions.len() {
        return Err(ApiError::VersionNotFound);
    }
    if body.version_index == sticker.active_version {
        return Ok(Json(json!({
            "sticker": sticker_dto(&sticker),
            "message": "version already active",
        })));
    }
    let updated = state
        .store
        .with_sticker(&sticker_id, |s| {
            s.active_version = body.version_index;
            s.content_markdown = s.versions[body.version_index].content_markdown.clone();
            s.clone()
        })
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "sticker": sticker_dto(&updated) })))
}

// ── Wiring ───────────────────────────────────────────────────────────────

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/explain-page", post(explain_page_handler))
        .route("/explain-page/status/:generation_id", get(generation_status_handler))
        .route(
            "/explain-page/session/:session_id",
            get(session_get_handler)
                .patch(session_patch_handler)
                .delete(session_delete_handler),
        )
        .route("/explain-page/sticker/:sticker_id/refresh", post(sticker_refresh_handler))
        .route(
            "/explain-page/sticker/:sticker_id/version",
            get(sticker_versions_handler).patch(sticker_version_patch_handler),
        )
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("starting marginalia server on {}", addr);

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on {}", addr);

    axum::serve(listener, app).await.map_err(|e| {
        error!("server exited: {}", e);
        e.into()
    })
}
