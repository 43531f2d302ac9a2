// SPDX-License-Identifier: MIT OR Apache-2.0
//! The connection manager: one shared session with bounded reconnects.

use crate::driver::{ConnectOptions, DriverError, StorageDriver};
use crate::state::{
    ConnectionEvent, ConnectionState, EventKind, HealthReport, HealthStatus, Phase,
};
use chrono::{DateTime, Utc};
use folio_cancel::CancellationToken;
use folio_config::{DatabaseConfig, redact_uri};
use folio_error::{ErrorCode, Failure, TypedError, normalize};
use folio_retry::{Backoff, RetryPolicy, with_retry};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// How hard `connect()` tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionPolicy {
    /// Attempts per connect call, including the first.
    pub max_retries: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30))
                .with_jitter(0.25),
        }
    }
}

impl From<&DatabaseConfig> for ConnectionPolicy {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Backoff::exponential(cfg.base_delay(), cfg.max_delay()).with_jitter(cfg.jitter),
        }
    }
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Debug)]
struct Cell {
    phase: Phase,
    retry_count: u32,
    last_connected_at: Option<DateTime<Utc>>,
    ever_connected: bool,
    /// Set by an explicit `disconnect()`; suppresses monitor reconnects.
    closed: bool,
}

struct Shared<D: ?Sized> {
    target: String,
    redacted: String,
    options: ConnectOptions,
    policy: ConnectionPolicy,
    cell: Mutex<Cell>,
    connect_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<Listener>>,
    events: broadcast::Sender<ConnectionEvent>,
    driver: Arc<D>,
}

/// Owns the process-wide storage session.
///
/// Cloning is cheap; every clone observes the same state. `connect()` calls
/// are serialised, so concurrent callers share one retry loop and the
/// second caller returns as soon as the first succeeds.
pub struct ConnectionManager<D: ?Sized + StorageDriver = dyn StorageDriver> {
    shared: Arc<Shared<D>>,
}

impl<D: ?Sized + StorageDriver> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: ?Sized + StorageDriver> fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.shared.redacted)
            .field("phase", &self.cell().phase)
            .finish_non_exhaustive()
    }
}

impl<D: ?Sized + StorageDriver> ConnectionManager<D> {
    /// A manager for `target` in the `Disconnected` phase.
    pub fn new(
        driver: Arc<D>,
        target: impl Into<String>,
        options: ConnectOptions,
        policy: ConnectionPolicy,
    ) -> Self {
        let target = target.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                redacted: redact_uri(&target),
                target,
                options,
                policy,
                cell: Mutex::new(Cell {
                    phase: Phase::Disconnected,
                    retry_count: 0,
                    last_connected_at: None,
                    ever_connected: false,
                    closed: false,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                events,
                driver,
            }),
        }
    }

    /// A manager configured from the `[database]` section.
    pub fn from_config(driver: Arc<D>, cfg: &DatabaseConfig) -> Self {
        Self::new(
            driver,
            cfg.uri.clone(),
            ConnectOptions::from(cfg),
            ConnectionPolicy::from(cfg),
        )
    }

    /// The underlying driver.
    pub fn driver(&self) -> Arc<D> {
        Arc::clone(&self.shared.driver)
    }

    /// Retry policy used by `connect()`.
    pub fn policy(&self) -> &ConnectionPolicy {
        &self.shared.policy
    }

    /// Options handed to the driver.
    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    fn cell(&self) -> MutexGuard<'_, Cell> {
        self.shared
            .cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to the state and return the resulting snapshot.
    fn transition(&self, f: impl FnOnce(&mut Cell)) -> (Phase, u32) {
        let mut cell = self.cell();
        f(&mut cell);
        (cell.phase, cell.retry_count)
    }

    /// Current phase, retry count, and last connect time.
    pub fn status(&self) -> ConnectionState {
        let cell = self.cell();
        ConnectionState {
            phase: cell.phase,
            retry_count: cell.retry_count,
            last_connected_at: cell.last_connected_at,
            target: self.shared.redacted.clone(),
        }
    }

    /// `true` when the phase is `Connected` and the driver still holds a
    /// live session.
    pub fn is_connected(&self) -> bool {
        self.cell().phase == Phase::Connected && self.shared.driver.is_live()
    }

    pub(crate) fn should_auto_reconnect(&self) -> bool {
        let cell = self.cell();
        cell.ever_connected && !cell.closed
    }

    /// Register a listener called synchronously for every event.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// A channel of future events. Slow receivers observe `Lagged`.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn emit(
        &self,
        kind: EventKind,
        (phase, retry_count): (Phase, u32),
        delay: Option<Duration>,
        detail: Option<String>,
    ) {
        let event = ConnectionEvent {
            kind,
            phase,
            retry_count,
            timestamp: Utc::now(),
            delay_ms: delay.map(|d| d.as_millis() as u64),
            detail,
        };

        let uri = self.shared.redacted.as_str();
        match kind {
            EventKind::Connected | EventKind::Reconnected => {
                info!(target: "folio.db", uri, event = %kind, "database session established");
            }
            EventKind::Disconnected => {
                warn!(target: "folio.db", uri, reason = event.detail.as_deref(), "database session closed");
            }
            EventKind::Retrying => {
                warn!(
                    target: "folio.db",
                    uri,
                    retry_count,
                    delay_ms = event.delay_ms,
                    error = event.detail.as_deref(),
                    "database connect failed, retrying"
                );
            }
            EventKind::Error => {
                error!(
                    target: "folio.db",
                    uri,
                    retry_count,
                    error = event.detail.as_deref(),
                    "database connect attempts exhausted"
                );
            }
        }

        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in &listeners {
            listener(&event);
        }
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    /// Establish the session, retrying with jittered backoff.
    ///
    /// Returns immediately when already connected. Each call gets a fresh
    /// window of `max_retries` attempts; exhausting it leaves the phase at
    /// `Erroring` and returns a non-retryable `DB_CONNECTION_FAILED`.
    /// Cancelling `cancel` aborts the in-flight attempt or backoff wait with
    /// `OPERATION_CANCELLED`.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), TypedError> {
        let _serial = self.shared.connect_lock.lock().await;

        if self.is_connected() {
            debug!(target: "folio.db", "connect called while connected");
            return Ok(());
        }
        self.mark_lost("session no longer live");
        self.transition(|c| c.closed = false);

        let max_attempts = self.shared.policy.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(self.connect_cancelled(attempt));
            }
            attempt += 1;
            self.transition(|c| c.phase = Phase::Connecting);
            debug!(target: "folio.db", attempt, max_attempts, uri = %self.shared.redacted, "connecting");

            let attempt_fut = tokio::time::timeout(
                self.shared.options.server_selection_timeout,
                self.shared
                    .driver
                    .connect(&self.shared.target, &self.shared.options),
            );
            let outcome = match cancel.run_until_cancelled(attempt_fut).await {
                None => return Err(self.connect_cancelled(attempt)),
                Some(Ok(result)) => result,
                Some(Err(_elapsed)) => Err(DriverError::timeout("server selection")),
            };
            let err = match outcome {
                Ok(()) => {
                    let mut reconnected = false;
                    let mut closed = false;
                    let snapshot = self.transition(|c| {
                        if c.closed {
                            closed = true;
                            return;
                        }
                        reconnected = c.ever_connected;
                        c.phase = Phase::Connected;
                        c.retry_count = 0;
                        c.last_connected_at = Some(Utc::now());
                        c.ever_connected = true;
                    });
                    if closed {
                        // The session came up after an explicit disconnect.
                        self.shared.driver.close().await;
                        return Err(self.connect_aborted(attempt));
                    }
                    let kind = if reconnected {
                        EventKind::Reconnected
                    } else {
                        EventKind::Connected
                    };
                    self.emit(kind, snapshot, None, None);
                    return Ok(());
                }
                Err(e) => e,
            };
            if self.cell().closed {
                return Err(self.connect_aborted(attempt));
            }

            let snapshot = self.transition(|c| c.retry_count += 1);

            if attempt >= max_attempts {
                let snapshot = self.transition(|c| c.phase = Phase::Erroring);
                self.emit(EventKind::Error, snapshot, None, Some(err.to_string()));
                return Err(TypedError::new(
                    ErrorCode::DbConnectionFailed,
                    format!(
                        "could not connect to {} after {attempt} attempt(s)",
                        self.shared.redacted
                    ),
                )
                .with_retryable(false)
                .with_detail("attempts", attempt)
                .with_detail("target", &self.shared.redacted)
                .with_source(err));
            }

            let delay = self.shared.policy.backoff.delay(attempt);
            self.emit(EventKind::Retrying, snapshot, Some(delay), Some(err.to_string()));

            if cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return Err(self.connect_cancelled(attempt));
            }
            if self.cell().closed {
                return Err(self.connect_aborted(attempt));
            }
        }
    }

    /// `disconnect()` ran while this connect was in flight.
    fn connect_aborted(&self, attempts: u32) -> TypedError {
        self.transition(|c| c.phase = Phase::Disconnected);
        info!(target: "folio.db", attempts, "connect abandoned after disconnect");
        TypedError::new(
            ErrorCode::OperationCancelled,
            "database connect abandoned by disconnect",
        )
        .with_detail("attempts", attempts)
    }

    fn connect_cancelled(&self, attempts: u32) -> TypedError {
        self.transition(|c| c.phase = Phase::Disconnected);
        info!(target: "folio.db", attempts, "connect cancelled");
        TypedError::new(ErrorCode::OperationCancelled, "database connect cancelled")
            .with_detail("attempts", attempts)
    }

    /// Close the session. Safe to call in any phase; emits `Disconnected`
    /// only when leaving another phase.
    ///
    /// A `connect()` still retrying gives up at its next checkpoint with
    /// `OPERATION_CANCELLED` instead of reopening the session.
    pub async fn disconnect(&self) {
        let mut previous = Phase::Disconnected;
        let snapshot = self.transition(|c| {
            previous = c.phase;
            c.phase = Phase::Disconnected;
            c.closed = true;
        });
        self.shared.driver.close().await;
        if previous != Phase::Disconnected {
            self.emit(
                EventKind::Disconnected,
                snapshot,
                None,
                Some("closed by caller".to_string()),
            );
        }
    }

    /// Probe the session. Never pings unless the phase is `Connected`.
    pub async fn health_check(&self) -> HealthReport {
        let phase = self.cell().phase;
        if phase != Phase::Connected {
            return HealthReport {
                status: HealthStatus::Unhealthy {
                    reason: format!("database {phase}"),
                },
                phase,
                latency: None,
                checked_at: Utc::now(),
            };
        }

        let started = Instant::now();
        let probe =
            tokio::time::timeout(self.shared.options.socket_timeout, self.shared.driver.ping())
                .await;
        let (status, latency) = match probe {
            Ok(Ok(())) => (HealthStatus::Healthy, Some(started.elapsed())),
            Ok(Err(e)) => (
                HealthStatus::Unhealthy {
                    reason: format!("ping failed: {e}"),
                },
                None,
            ),
            Err(_) => (
                HealthStatus::Unhealthy {
                    reason: "ping timed out".to_string(),
                },
                None,
            ),
        };
        HealthReport {
            status,
            phase,
            latency,
            checked_at: Utc::now(),
        }
    }

    /// Drop `Connected → Disconnected`, emitting `Disconnected`. Returns
    /// whether a transition happened.
    fn mark_lost(&self, reason: &str) -> bool {
        let mut was_connected = false;
        let snapshot = self.transition(|c| {
            if c.phase == Phase::Connected {
                was_connected = true;
                c.phase = Phase::Disconnected;
            }
        });
        if was_connected {
            self.emit(
                EventKind::Disconnected,
                snapshot,
                None,
                Some(reason.to_string()),
            );
        }
        was_connected
    }

    /// Record a lost session and reconnect through the normal retry loop.
    pub async fn handle_connection_lost(
        &self,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TypedError> {
        self.mark_lost(reason);
        self.connect(cancel).await
    }

    /// Run one storage operation against the live session.
    ///
    /// Fails fast with a retryable `DB_CONNECTION_FAILED` when not
    /// connected. The operation is bounded by the socket timeout; driver
    /// failures are normalized.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, TypedError>
    where
        F: FnOnce(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        self.guarded(op(self.driver())).await
    }

    /// [`execute`](Self::execute) under a [`RetryPolicy`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TypedError>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let this = self;
        with_retry(policy, cancel, move || this.guarded(op(this.driver()))).await
    }

    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, DriverError>>,
    ) -> Result<T, TypedError> {
        if !self.is_connected() {
            let phase = self.cell().phase;
            return Err(
                TypedError::new(ErrorCode::DbConnectionFailed, "no live database session")
                    .with_detail("phase", phase),
            );
        }
        match tokio::time::timeout(self.shared.options.socket_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if matches!(err, DriverError::Transport { .. }) && !self.shared.driver.is_live() {
                    self.mark_lost(&err.to_string());
                }
                Err(normalize(err))
            }
            Err(_) => Err(normalize(Failure::StorageTimeout {
                operation: "execute".to_string(),
            })),
        }
    }
}
