// SPDX-License-Identifier: MIT OR Apache-2.0
//! folio-daemon
//!
//! The HTTP surface of the Folio backend: health and connection status
//! endpoints, request-id and logging middleware, and the error boundary that
//! turns any failure into a normalized client payload.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The error boundary.
pub mod error;
/// Middleware stack for the HTTP surface.
pub mod middleware;

pub use error::ApiError;
pub use middleware::RequestId;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, Uri},
    middleware::from_fn,
    routing::get,
};
use chrono::{DateTime, Utc};
use folio_config::ServerConfig;
use folio_db::{ConnectionManager, ConnectionState, HealthReport};
use folio_error::{ResponseMode, TypedError};
use middleware::{RateLimiter, RequestLogger, cors_layer, request_id_middleware};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide storage session.
    pub db: ConnectionManager,
    /// Server settings the router was built from.
    pub server: ServerConfig,
    /// When the process started serving.
    pub started: Instant,
}

impl AppState {
    /// State for `db` configured by `server`.
    pub fn new(db: ConnectionManager, server: ServerConfig) -> Self {
        Self {
            db,
            server,
            started: Instant::now(),
        }
    }

    /// How much detail error responses may carry.
    pub fn response_mode(&self) -> ResponseMode {
        if self.server.debug_errors {
            ResponseMode::Debug
        } else {
            ResponseMode::Production
        }
    }
}

/// Rolled-up service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Storage answered its ping.
    Ok,
    /// Storage is unreachable; requests needing it will fail.
    Degraded,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `OK` or `DEGRADED`.
    pub status: ServiceStatus,
    /// Storage probe result.
    pub database: HealthReport,
    /// Seconds since the server started.
    pub uptime: u64,
    /// When the probe ran.
    pub timestamp: DateTime<Utc>,
}

/// Build the Axum router with all routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mode = state.response_mode();
    let per_minute = state.server.rate_limit_per_minute;
    let origins = state.server.allowed_origins.clone();

    let mut app = Router::new()
        .route("/health", get(cmd_health))
        .route("/status", get(cmd_status))
        .fallback(cmd_not_found)
        .with_state(state);

    if per_minute > 0 {
        let limiter = RateLimiter::new(per_minute, Duration::from_secs(60), mode);
        app = app.layer(limiter.into_layer());
    }
    app = app
        .layer(from_fn(RequestLogger::layer))
        .layer(from_fn(request_id_middleware));
    if !origins.is_empty() {
        app = app.layer(cors_layer(&origins));
    }
    app
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.db.health_check().await;
    let (code, status) = if database.status.is_healthy() {
        (StatusCode::OK, ServiceStatus::Ok)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, ServiceStatus::Degraded)
    };
    let body = HealthResponse {
        status,
        database,
        uptime: state.started.elapsed().as_secs(),
        timestamp: Utc::now(),
    };
    (code, Json(body))
}

async fn cmd_status(State(state): State<Arc<AppState>>) -> Json<ConnectionState> {
    Json(state.db.status())
}

async fn cmd_not_found(
    State(state): State<Arc<AppState>>,
    request_id: RequestId,
    uri: Uri,
) -> ApiError {
    ApiError::new(
        TypedError::not_found(format!("route {}", uri.path())),
        request_id,
        state.response_mode(),
    )
}

/// Log any panic, then terminate the process with status 1.
///
/// Tokio contains panics inside spawned tasks, so without this a panicking
/// monitor would leave the server running with nothing reconnecting storage.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(target: "folio.daemon", panic = %info, "uncaught panic, exiting");
        default_hook(info);
        std::process::exit(1);
    }));
}
