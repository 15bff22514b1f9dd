//! API Server - HTTP server for the management API

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, header::WWW_AUTHENTICATE, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::handlers::{self, ApiError, AppState};
use crate::management::RelayManager;

pub struct ApiServer {
    state: Arc<AppState>,
    addr: String,
}

impl ApiServer {
    pub fn new(manager: RelayManager, addr: String) -> Self {
        Self {
            state: Arc::new(AppState { manager }),
            addr,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        // Public routes (no auth required)
        let public_routes = Router::new().route("/health", get(handlers::health));

        // Admin routes (HTTP Basic credentials of an admin account)
        let admin_routes = Router::new()
            .route("/stats", get(handlers::stats))
            .route("/messages", get(handlers::recent_messages))
            .route("/users", get(handlers::list_users).post(handlers::create_user))
            .route("/users/:username/deactivate", post(handlers::deactivate_user))
            .route("/users/:username/password", post(handlers::reset_password))
            .route("/relay/start", post(handlers::start_relay))
            .route("/relay/stop", post(handlers::stop_relay))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                admin_auth_middleware,
            ));

        Router::new()
            .merge(public_routes)
            .nest("/api", admin_routes)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> std::io::Result<()> {
        let router = self.router();

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

/// `Authorization: Basic base64(username:password)`
fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"relay-rs\"")],
        Json(ApiError::new(message)),
    )
        .into_response()
}

/// Authentication middleware - requires admin credentials
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let credentials = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(decode_basic_auth);

    let Some((username, password)) = credentials else {
        warn!("Missing or invalid Authorization header");
        return unauthorized("Missing or invalid Authorization header");
    };

    match state.manager.authenticate_admin(&username, &password).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            warn!("API authentication failed for {}", username);
            unauthorized("Invalid credentials")
        }
        Err(e) => handlers::api_error(e).into_response(),
    }
}
