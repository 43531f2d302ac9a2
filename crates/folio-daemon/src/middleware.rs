// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the Folio HTTP surface.

use crate::error::ApiError;
use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{HeaderValue, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use folio_error::{ErrorCode, ResponseMode, TypedError};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use uuid::Uuid;

/// Header carrying the request identifier in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// Identifier correlating a response with server logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept a client-supplied id when it is short, non-empty, visible ASCII.
    fn from_header(raw: &str) -> Option<Self> {
        let ok = !raw.is_empty()
            && raw.len() <= MAX_REQUEST_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        ok.then(|| Self(raw.to_string()))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(RequestId::generate))
    }
}

/// Reuse the caller's `x-request-id` or mint one, expose it as a request
/// extension, and echo it on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(RequestId::from_header)
        .unwrap_or_else(RequestId::generate);
    req.extensions_mut().insert(id.clone());
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Logs method, path, status and duration for each request.
pub struct RequestLogger;

impl RequestLogger {
    /// Axum-compatible handler function.
    pub async fn layer(req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let start = Instant::now();

        let resp = next.run(req).await;
        let status = resp.status().as_u16();
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::event!(
            target: "folio.daemon",
            tracing::Level::INFO,
            http.method = %method,
            http.path = %path,
            http.status = status,
            http.duration_ms = duration_ms,
            request_id = %request_id,
            "request completed"
        );

        resp
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// In-memory sliding-window rate limiter shared by all clients.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
    mode: ResponseMode,
}

impl RateLimiter {
    /// Allow `max_requests` within `window`. Rejections are formatted with
    /// `mode`.
    pub fn new(max_requests: u32, window: Duration, mode: ResponseMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
            mode,
        }
    }

    /// Record a request, or fail with `RATE_LIMITED` when the window is full.
    pub async fn check(&self) -> Result<(), TypedError> {
        let now = Instant::now();
        let mut stamps = self.inner.lock().await;

        while let Some(&front) = stamps.front() {
            if now.duration_since(front) > self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() as u32 >= self.max_requests {
            return Err(TypedError::new(
                ErrorCode::RateLimited,
                format!(
                    "more than {} requests in {}s",
                    self.max_requests,
                    self.window.as_secs()
                ),
            ));
        }

        stamps.push_back(now);
        Ok(())
    }

    /// Wrap this limiter in a Tower layer.
    pub fn into_layer(self) -> RateLimiterLayer {
        RateLimiterLayer(self)
    }
}

/// Tower [`Layer`](tower::Layer) enforcing a [`RateLimiter`].
#[derive(Clone)]
pub struct RateLimiterLayer(RateLimiter);

impl<S: Clone> tower::Layer<S> for RateLimiterLayer {
    type Service = RateLimiterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimiterService {
            limiter: self.0.clone(),
            inner,
        }
    }
}

/// Service produced by [`RateLimiterLayer`].
#[derive(Clone)]
pub struct RateLimiterService<S> {
    limiter: RateLimiter,
    inner: S,
}

impl<S> tower::Service<Request<Body>> for RateLimiterService<S>
where
    S: tower::Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if let Err(err) = limiter.check().await {
                let request_id = req
                    .extensions()
                    .get::<RequestId>()
                    .cloned()
                    .unwrap_or_else(RequestId::generate);
                return Ok(ApiError::new(err, request_id, limiter.mode).into_response());
            }
            inner.call(req).await
        })
    }
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// CORS layer admitting `origins` for simple JSON requests. Origins that
/// are not valid header values are skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static(REQUEST_ID_HEADER),
        ]))
}
