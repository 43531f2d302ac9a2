// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection phase, status snapshots, lifecycle events, and health reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where the connection manager is in its lifecycle.
///
/// `Disconnected → Connecting → Connected`; a failed attempt moves through
/// `Erroring` once the retry window is exhausted. A lost session drops
/// `Connected → Disconnected` and the next connect reports `Reconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No session and no attempt in flight.
    Disconnected,
    /// An attempt or backoff wait is in progress.
    Connecting,
    /// A live session exists.
    Connected,
    /// The last retry window was exhausted.
    Erroring,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Erroring => "erroring",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot returned by `status()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: Phase,
    /// Failed attempts since the last successful connect.
    pub retry_count: u32,
    /// When the current or most recent session was established.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Target with credentials redacted.
    pub target: String,
}

impl ConnectionState {
    /// Shorthand for `phase == Connected`.
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First session established.
    Connected,
    /// Session closed or lost.
    Disconnected,
    /// Session re-established after a loss.
    Reconnected,
    /// An attempt failed and another is scheduled.
    Retrying,
    /// The retry window was exhausted.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnected => "reconnected",
            Self::Retrying => "retrying",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle notification delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Event type.
    pub kind: EventKind,
    /// Phase after the transition.
    pub phase: Phase,
    /// Retry count after the transition.
    pub retry_count: u32,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Scheduled backoff for `Retrying` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Driver error text or disconnect reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of a health probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Ping succeeded.
    Healthy,
    /// Not connected, or the ping failed.
    Unhealthy {
        /// Why.
        reason: String,
    },
}

impl HealthStatus {
    /// `true` for [`HealthStatus::Healthy`].
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Result of `health_check()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    /// Probe outcome.
    #[serde(flatten)]
    pub status: HealthStatus,
    /// Phase observed when the probe ran.
    pub phase: Phase,
    /// Ping round-trip, when a ping was sent and answered.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_millis"
    )]
    pub latency: Option<Duration>,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Human-readable summary: `"connected"` or the failure reason.
    pub fn detail(&self) -> &str {
        match &self.status {
            HealthStatus::Healthy => "connected",
            HealthStatus::Unhealthy { reason } => reason,
        }
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match val {
            Some(d) => (d.as_millis() as u64).serialize(ser),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let opt: Option<u64> = Option::deserialize(de)?;
        Ok(opt.map(Duration::from_millis))
    }
}
