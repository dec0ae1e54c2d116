//! Endpoint handlers and the error → status-code mapping.

use super::AppState;
use crate::error::{ConflictError, Error, UnavailableError};
use crate::session::SessionInfo;
use crate::store::SessionRecord;
use crate::types::{MediaKind, ProxyConfig, SessionStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wrapper turning core errors into JSON responses per the taxonomy:
/// validation 400, not-found 404, conflicts 409/400, transient upstream
/// 502, unavailable 404 with a discriminator, internal 500.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

fn status_and_kind(e: &Error) -> (StatusCode, &'static str) {
    match e {
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::Conflict(c) => match c {
            ConflictError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
            ConflictError::AlreadyConnected => (StatusCode::CONFLICT, "already_connected"),
            // Callers poll the QR endpoint until pairing completes; a
            // logged-in session reads as "no QR here".
            ConflictError::AlreadyLoggedIn => (StatusCode::NOT_FOUND, "already_logged_in"),
            ConflictError::NotLoggedIn => (StatusCode::BAD_REQUEST, "not_logged_in"),
            ConflictError::NotConnected => (StatusCode::BAD_REQUEST, "not_connected"),
        },
        Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
        Error::Unavailable(u) => match u {
            UnavailableError::NoQrAvailable => (StatusCode::NOT_FOUND, "no_qr_available"),
            UnavailableError::QrExpired => (StatusCode::NOT_FOUND, "qr_expired"),
        },
        Error::Store(_) | Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = status_and_kind(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        let body = Json(serde_json::json!({
            "error": { "kind": kind, "message": self.0.to_string() }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---- DTOs ----

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct SessionView {
    pub id: uuid::Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub device_jid: Option<String>,
    pub connected: bool,
    pub connection_error: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SessionView {
    fn from_record(rec: SessionRecord) -> Self {
        Self {
            id: rec.id,
            name: rec.name,
            status: rec.status,
            device_jid: rec.device_jid.map(|j| j.to_string()),
            connected: rec.connected,
            connection_error: rec.connection_error,
            proxy: rec.proxy,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            connected_at: rec.connected_at,
            last_seen: rec.last_seen,
        }
    }
}

#[derive(Serialize)]
pub struct SessionInfoView {
    #[serde(flatten)]
    pub record: SessionView,
    /// Live handle state; absent when the session is not loaded in this
    /// process (e.g. after a restart, before the first connect).
    pub live: Option<SessionInfo>,
}

#[derive(Serialize)]
pub struct QrView {
    pub qr_code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct SetProxyRequest {
    pub url: String,
}

#[derive(Deserialize)]
pub struct SendTextRequest {
    pub to: String,
    pub body: String,
}

#[derive(Deserialize)]
pub struct SendMediaRequest {
    pub to: String,
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Deserialize)]
pub struct SendLocationRequest {
    pub to: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct SendContactRequest {
    pub to: String,
    pub display_name: String,
    pub vcard: String,
}

#[derive(Deserialize)]
pub struct ChatwootWebhookRequest {
    pub to: String,
    #[serde(alias = "content")]
    pub text: String,
}

// ---- Handlers ----

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state.registry.create(&req.name).await?;
    Ok(Json(SessionView::from_record(record)))
}

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let sessions: Vec<SessionView> = state
        .registry
        .list()
        .await?
        .into_iter()
        .map(SessionView::from_record)
        .collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn session_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (record, live) = state.registry.info(&name).await?;
    Ok(Json(SessionInfoView {
        record: SessionView::from_record(record),
        live,
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.delete(&name).await?;
    Ok(Json(serde_json::json!({ "deleted": name })))
}

pub async fn connect_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.connect(&name).await?;
    Ok(Json(serde_json::json!({ "connecting": name })))
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.disconnect(&name).await?;
    Ok(Json(serde_json::json!({ "disconnected": name })))
}

pub async fn logout_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.logout(&name).await?;
    Ok(Json(serde_json::json!({ "logged_out": name })))
}

pub async fn session_qr(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (qr_code, expires_at) = state.registry.qr(&name).await?;
    Ok(Json(QrView {
        qr_code,
        expires_at,
    }))
}

pub async fn set_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetProxyRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .registry
        .set_proxy(&name, ProxyConfig { url: req.url })
        .await?;
    Ok(Json(serde_json::json!({ "proxy_set": name })))
}

pub async fn find_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let proxy = state.registry.proxy(&name).await?;
    Ok(Json(serde_json::json!({ "proxy": proxy })))
}

pub async fn send_text(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SendTextRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.registry.send_text(&name, &req.to, &req.body).await?;
    Ok(Json(receipt))
}

pub async fn send_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SendMediaRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .registry
        .send_media(&name, &req.to, req.kind, &req.url, &req.mime_type, req.caption)
        .await?;
    Ok(Json(receipt))
}

pub async fn send_location(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SendLocationRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .registry
        .send_location(&name, &req.to, req.latitude, req.longitude, req.name)
        .await?;
    Ok(Json(receipt))
}

pub async fn send_contact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SendContactRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .registry
        .send_contact(&name, &req.to, &req.display_name, &req.vcard)
        .await?;
    Ok(Json(receipt))
}

/// Chatwoot ingestion: relay an agent reply as an outbound text send.
pub async fn chatwoot_webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ChatwootWebhookRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.registry.send_text(&name, &req.to, &req.text).await?;
    Ok(Json(receipt))
}
