//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::RelayError;
use crate::management::{RelayManager, RelayStats};
use crate::storage::MessageListing;
use crate::users::AccountSummary;

/// Default number of messages returned by `/api/messages`
const DEFAULT_MESSAGE_LIMIT: usize = 20;

/// Shared application state
pub struct AppState {
    pub manager: RelayManager,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            error: msg.to_string(),
        }
    }
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// Map a relay error onto an HTTP status
pub fn api_error(err: RelayError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        RelayError::DuplicateAccount(_) => StatusCode::CONFLICT,
        RelayError::AccountNotFound(_) | RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Parse(_) | RelayError::InvalidEmail(_) | RelayError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        RelayError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        _ => {
            error!("API request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiError::new(&err.to_string())))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<RelayStats> {
    state.manager.stats().await.map(Json).map_err(api_error)
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

/// GET /api/messages?limit=N
pub async fn recent_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Vec<MessageListing>> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    state
        .manager
        .recent_messages(limit)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/users
pub async fn list_users(State(state): State<Arc<AppState>>) -> Json<Vec<AccountSummary>> {
    Json(state.manager.list_accounts().await)
}

/// User creation request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// POST /api/users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<AccountSummary>), (StatusCode, Json<ApiError>)> {
    info!("Admin: creating account {}", req.username);

    if req.password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("Password cannot be empty")),
        ));
    }

    state
        .manager
        .create_account(&req.username, &req.password, req.is_admin)
        .await
        .map(|summary| (StatusCode::CREATED, Json(summary)))
        .map_err(api_error)
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn new(status: &str) -> Json<Self> {
        Json(Self {
            status: status.to_string(),
        })
    }
}

/// POST /api/users/:username/deactivate
pub async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<StatusResponse> {
    info!("Admin: deactivating account {}", username);
    state
        .manager
        .deactivate_account(&username)
        .await
        .map(|_| StatusResponse::new("deactivated"))
        .map_err(api_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

/// POST /api/users/:username/password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Json(req): Json<PasswordRequest>,
) -> ApiResult<StatusResponse> {
    info!("Admin: resetting password for {}", username);

    if req.password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("Password cannot be empty")),
        ));
    }

    state
        .manager
        .reset_password(&username, &req.password)
        .await
        .map(|_| StatusResponse::new("updated"))
        .map_err(api_error)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayControlResponse {
    pub running: bool,
    pub listen_address: Option<String>,
}

/// POST /api/relay/start
pub async fn start_relay(State(state): State<Arc<AppState>>) -> ApiResult<RelayControlResponse> {
    let addr = state.manager.start().await.map_err(api_error)?;
    Ok(Json(RelayControlResponse {
        running: true,
        listen_address: Some(addr.to_string()),
    }))
}

/// POST /api/relay/stop
pub async fn stop_relay(State(state): State<Arc<AppState>>) -> ApiResult<RelayControlResponse> {
    state.manager.stop().await.map_err(api_error)?;
    Ok(Json(RelayControlResponse {
        running: false,
        listen_address: None,
    }))
}
