// SPDX-License-Identifier: MIT OR Apache-2.0
//! folio-db
//!
//! Owns the single storage session shared by the Folio backend.
//!
//! [`ConnectionManager`] establishes the session with bounded, jittered
//! exponential backoff, reports lifecycle [`ConnectionEvent`]s, answers
//! health probes, and reconnects after a lost session. Concrete drivers plug
//! in through [`StorageDriver`]; [`InMemoryDriver`] serves `memory://`
//! targets and tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod manager;
mod memory;
mod monitor;
mod state;

pub use driver::{ConnectOptions, DriverError, StorageDriver};
pub use manager::{ConnectionManager, ConnectionPolicy};
pub use memory::InMemoryDriver;
pub use state::{ConnectionEvent, ConnectionState, EventKind, HealthReport, HealthStatus, Phase};
