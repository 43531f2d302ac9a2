// SPDX-License-Identifier: MIT OR Apache-2.0
//! The seam between the connection manager and a concrete document-store
//! driver.

use async_trait::async_trait;
use folio_config::DatabaseConfig;
use folio_error::{Failure, FieldViolation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Pool and timeout settings handed to the driver on every connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Minimum pooled sockets.
    pub pool_min: u32,
    /// Maximum pooled sockets.
    pub pool_max: u32,
    /// Close pooled sockets idle this long.
    pub idle_timeout: Duration,
    /// Give up selecting a server after this long.
    pub server_selection_timeout: Duration,
    /// Per-operation socket timeout.
    pub socket_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            pool_min: 2,
            pool_max: 10,
            idle_timeout: Duration::from_secs(30),
            server_selection_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(45),
        }
    }
}

impl From<&DatabaseConfig> for ConnectOptions {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            pool_min: cfg.pool_min,
            pool_max: cfg.pool_max,
            idle_timeout: cfg.idle_timeout(),
            server_selection_timeout: cfg.server_selection_timeout(),
            socket_timeout: cfg.socket_timeout(),
        }
    }
}

/// Failures reported by a storage driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A unique index rejected the write. `message` is the server's text.
    #[error("duplicate key: {message}")]
    DuplicateKey {
        /// Server message naming the index and key.
        message: String,
    },

    /// The operation or server selection exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// What timed out.
        operation: String,
    },

    /// Connection refused, reset, or no server available.
    #[error("transport error: {message}")]
    Transport {
        /// Driver message.
        message: String,
    },

    /// A value could not be cast to the stored type.
    #[error("cannot cast {field}={value:?} to {expected}")]
    Cast {
        /// Field being cast.
        field: String,
        /// Raw value.
        value: String,
        /// Target type.
        expected: String,
    },

    /// Document schema validation rejected the write.
    #[error("document validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldViolation>),

    /// Anything else the driver reports.
    #[error("{message}")]
    Other {
        /// Driver message.
        message: String,
    },
}

impl DriverError {
    /// Transport error shorthand.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Timeout shorthand.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

impl From<DriverError> for Failure {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::DuplicateKey { message } => Failure::DuplicateKey { message },
            DriverError::Timeout { operation } => Failure::StorageTimeout { operation },
            DriverError::Transport { message } => Failure::StorageTransport { message },
            DriverError::Cast {
                field,
                value,
                expected,
            } => Failure::Cast {
                field,
                value,
                expected,
            },
            DriverError::Validation(violations) => Failure::FieldValidation(violations),
            other @ DriverError::Other { .. } => Failure::other(other),
        }
    }
}

/// A document-store driver owning one pool-backed session.
///
/// The driver's pool serialises physical sockets; callers share it without
/// extra locking.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Establish the session. Called again after a lost session.
    async fn connect(&self, target: &str, options: &ConnectOptions) -> Result<(), DriverError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Close the session. Must be a no-op when already closed.
    async fn close(&self);

    /// Whether the driver currently holds a live session.
    fn is_live(&self) -> bool;
}
