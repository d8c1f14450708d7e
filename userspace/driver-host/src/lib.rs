// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver host core: deferred work items, host event loop, driver discovery
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests in tests/
//!
//! PUBLIC API:
//!   - DriverHostContext: process-wide work-item queue drained by an event waiter
//!   - HostLoop: port-backed loop running one-shot wait handlers
//!   - Device / DeviceFlags: device records that work is queued against
//!   - DriverLoader / ManifestLoader / find_drivers: driver discovery
//!   - DriverHostConfig: TOML configuration with explicit defaults
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Work items run with no host lock held
//!   - Every queued work item runs exactly once, in per-producer order
//!
//! DEPENDENCIES:
//!   - nexus-kobj: events, ports and status codes
//!   - parking_lot: queue and loop state locks
//!   - serde/toml: configuration and driver manifests
//!   - thiserror: loader and config errors
//!   - bitflags: device flags
//!   - log: lifecycle tracing
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod config;
mod context;
mod device;
mod event_loop;
mod loader;

pub use config::{
    ConfigError, DriverHostConfig, DEFAULT_DISPATCHER_THREADS, DEFAULT_LOG_LEVEL,
    DEFAULT_WORK_ITEMS_PER_WAKE,
};
pub use context::DriverHostContext;
pub use device::{Device, DeviceFlags};
pub use event_loop::{HostLoop, WaitHandler};
pub use loader::{find_drivers, Driver, DriverLoader, DriverRecord, LoaderError, ManifestLoader};
pub use nexus_kobj::Status;

/// Result alias for driver host operations.
pub type Result<T> = core::result::Result<T, Status>;
