// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background health monitor that reconnects lost sessions.

use crate::driver::StorageDriver;
use crate::manager::ConnectionManager;
use crate::state::Phase;
use folio_cancel::CancellationToken;
use folio_error::TypedError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

impl<D: ?Sized + StorageDriver> ConnectionManager<D> {
    /// One monitor pass.
    ///
    /// Pings a connected session and reconnects when the ping fails. A
    /// session that was lost or exhausted after it had once connected is
    /// retried. Never-connected and explicitly closed managers are left
    /// alone.
    pub async fn check_and_recover(&self, cancel: &CancellationToken) -> Result<(), TypedError> {
        match self.status().phase {
            Phase::Connecting => Ok(()),
            Phase::Connected => {
                let report = self.health_check().await;
                if report.status.is_healthy() {
                    Ok(())
                } else {
                    self.handle_connection_lost(report.detail(), cancel).await
                }
            }
            Phase::Disconnected | Phase::Erroring => {
                if self.should_auto_reconnect() {
                    self.connect(cancel).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Spawn [`check_and_recover`](Self::check_and_recover) every
    /// `interval` until `cancel` fires. Failures are logged; the loop keeps
    /// running.
    pub fn spawn_monitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let interval_ms = interval.as_millis() as u64;
            info!(target: "folio.db", interval_ms, "connection monitor started");
            while cancel.run_until_cancelled(ticker.tick()).await.is_some() {
                if let Err(e) = manager.check_and_recover(&cancel).await {
                    error!(target: "folio.db", code = %e.code(), error = %e, "connection recovery failed");
                }
            }
            info!(target: "folio.db", "connection monitor stopped");
        })
    }
}
