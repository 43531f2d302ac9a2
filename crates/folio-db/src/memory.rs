// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scriptable in-process driver for `memory://` targets and tests.

use crate::driver::{ConnectOptions, DriverError, StorageDriver};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    live: bool,
    fail_connects: u32,
    fail_pings: u32,
    connect_latency: Duration,
    ping_latency: Duration,
    connect_calls: u32,
    ping_calls: u32,
    close_calls: u32,
    last_target: Option<String>,
    last_options: Option<ConnectOptions>,
}

/// A [`StorageDriver`] that never leaves the process.
///
/// Failures and latency are injected through the `fail_*` and `*_latency`
/// setters; call counters let tests assert how the manager drove it.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    state: Mutex<MemoryState>,
}

impl InMemoryDriver {
    /// A driver that connects on the first attempt.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Fail the next `n` connect calls with a transport error.
    pub fn fail_next_connects(&self, n: u32) {
        self.with_state(|s| s.fail_connects = n);
    }

    /// Fail the next `n` pings with a transport error.
    pub fn fail_next_pings(&self, n: u32) {
        self.with_state(|s| s.fail_pings = n);
    }

    /// Delay every connect by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.with_state(|s| s.connect_latency = latency);
    }

    /// Delay every ping by `latency`.
    pub fn set_ping_latency(&self, latency: Duration) {
        self.with_state(|s| s.ping_latency = latency);
    }

    /// Simulate the server dropping the session.
    pub fn drop_session(&self) {
        self.with_state(|s| s.live = false);
    }

    /// Number of connect calls so far.
    pub fn connect_calls(&self) -> u32 {
        self.with_state(|s| s.connect_calls)
    }

    /// Number of ping calls so far.
    pub fn ping_calls(&self) -> u32 {
        self.with_state(|s| s.ping_calls)
    }

    /// Number of close calls so far.
    pub fn close_calls(&self) -> u32 {
        self.with_state(|s| s.close_calls)
    }

    /// Target passed to the most recent connect.
    pub fn last_target(&self) -> Option<String> {
        self.with_state(|s| s.last_target.clone())
    }

    /// Options passed to the most recent connect.
    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.with_state(|s| s.last_options.clone())
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn connect(&self, target: &str, options: &ConnectOptions) -> Result<(), DriverError> {
        let latency = self.with_state(|s| {
            s.connect_calls += 1;
            s.last_target = Some(target.to_string());
            s.last_options = Some(options.clone());
            s.connect_latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with_state(|s| {
            if s.fail_connects > 0 {
                s.fail_connects -= 1;
                s.live = false;
                Err(DriverError::transport("connection refused"))
            } else {
                s.live = true;
                Ok(())
            }
        })
    }

    async fn ping(&self) -> Result<(), DriverError> {
        let latency = self.with_state(|s| {
            s.ping_calls += 1;
            s.ping_latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with_state(|s| {
            if !s.live {
                Err(DriverError::transport("session closed"))
            } else if s.fail_pings > 0 {
                s.fail_pings -= 1;
                Err(DriverError::transport("ping failed"))
            } else {
                Ok(())
            }
        })
    }

    async fn close(&self) {
        self.with_state(|s| {
            s.close_calls += 1;
            s.live = false;
        });
    }

    fn is_live(&self) -> bool {
        self.with_state(|s| s.live)
    }
}
