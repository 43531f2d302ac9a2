// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios across the connection manager, the retry policy and
//! the HTTP error boundary.

use anyhow::Context;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use folio_cancel::CancellationToken;
use folio_config::ServerConfig;
use folio_daemon::{ApiError, AppState, RequestId, build_app};
use folio_db::{
    ConnectOptions, ConnectionManager, ConnectionPolicy, DriverError, EventKind, InMemoryDriver,
    StorageDriver,
};
use folio_error::{ErrorCode, ErrorResponse, ResponseMode};
use folio_retry::RetryPolicy;
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

fn manager(driver: &Arc<InMemoryDriver>) -> ConnectionManager<InMemoryDriver> {
    ConnectionManager::new(
        Arc::clone(driver),
        "memory://folio",
        ConnectOptions::default(),
        ConnectionPolicy::default(),
    )
}

async fn health(app: axum::Router) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test(start_paused = true)]
async fn outage_degrades_health_until_recovered() {
    let driver = Arc::new(InMemoryDriver::new());
    let dyn_driver: Arc<dyn StorageDriver> = driver.clone();
    let db = ConnectionManager::new(
        dyn_driver,
        "memory://folio",
        ConnectOptions::default(),
        ConnectionPolicy::default(),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    db.subscribe(move |ev| sink.lock().unwrap().push(ev.kind));
    let cancel = CancellationToken::new();
    db.connect(&cancel).await.unwrap();
    let app = build_app(Arc::new(AppState::new(db.clone(), ServerConfig::default())));

    let (status, _) = health(app.clone()).await;
    assert_eq!(status, StatusCode::OK);

    driver.drop_session();
    driver.fail_next_connects(2);
    let (status, json) = health(app.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "DEGRADED");

    db.check_and_recover(&cancel).await.unwrap();
    let (status, json) = health(app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["database"]["phase"], "connected");

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Retrying,
            EventKind::Retrying,
            EventKind::Reconnected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn request_retry_rides_out_a_reconnect() {
    let driver = Arc::new(InMemoryDriver::new());
    let db = manager(&driver);
    let cancel = CancellationToken::new();
    db.connect(&cancel).await.unwrap();
    let monitor = db.spawn_monitor(Duration::from_millis(500), cancel.clone());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let value = db
        .execute_with_retry(
            &RetryPolicy::new(3, Duration::from_secs(1)),
            &cancel,
            move |d| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        d.drop_session();
                        Err(DriverError::transport("connection reset by peer"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(driver.connect_calls(), 2);

    cancel.cancel();
    monitor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_exhaustion_is_fatal_and_explained() {
    let driver = Arc::new(InMemoryDriver::new());
    driver.fail_next_connects(u32::MAX);
    let db = manager(&driver);

    let err = db
        .connect(&CancellationToken::new())
        .await
        .context("connect to memory://folio")
        .unwrap_err();

    let rendered = format!("{err:#}");
    assert!(rendered.contains("DB_CONNECTION_FAILED"), "{rendered}");
    assert!(rendered.contains("connection refused"), "{rendered}");
    assert_eq!(driver.connect_calls(), 5);
}

#[tokio::test]
async fn duplicate_username_reaches_client_as_conflict() {
    let message = r#"E11000 duplicate key error collection: folio.users index: username_1 dup key: { username: "jane" }"#;
    let api = ApiError::new(
        DriverError::DuplicateKey {
            message: message.into(),
        },
        RequestId::from("req-dup"),
        ResponseMode::Production,
    );

    let resp = api.into_response();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body.error.code, ErrorCode::DbDuplicateKey);
    assert_eq!(body.request_id, "req-dup");
    let validation = body.error.validation.unwrap();
    assert_eq!(validation[0].field, "username");
    assert!(validation[0].value.is_none());
    assert!(!format!("{:?}", body.error.message).contains("E11000"));
}
