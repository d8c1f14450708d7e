// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: driverhostd daemon: wires the work runner, dispatcher, driver discovery and PCI root host
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + CLI tests in tests/
//!
//! PUBLIC API:
//!   - cli::{help, parse_args, execute, run}: command line entry points
//!   - DaemonConfig: `[host]` + `[root_host]` configuration file
//!   - Daemon: running host with bound drivers
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Drivers are bound only from the host loop thread
//!
//! DEPENDENCIES:
//!   - nexus-driver-host: host loop, work items, driver discovery
//!   - nexus-driver-runtime: dispatcher and control channels
//!   - nexus-pci-root: PCI window allocation
//!   - env_logger: process logger, `RUST_LOG` aware
//!   - thiserror: daemon errors
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod cli;
mod config;
mod daemon;

use std::path::PathBuf;

use thiserror::Error;

pub use cli::{execute, help, parse_args, run, Options};
pub use config::DaemonConfig;
pub use daemon::{BoundDriver, Daemon};
pub use nexus_kobj::Status;

/// Errors that stop the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Bad command line.
    #[error("{0}")]
    Usage(String),
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for the daemon.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The `[host]` table is invalid.
    #[error("host config: {0}")]
    HostConfig(#[from] nexus_driver_host::ConfigError),
    /// The `[root_host]` table is invalid.
    #[error("root host config: {0}")]
    RootHostConfig(#[from] nexus_pci_root::ConfigError),
    /// Driver discovery failed.
    #[error("driver discovery: {0}")]
    Loader(#[from] nexus_driver_host::LoaderError),
    /// A core operation failed.
    #[error("driver host: {0}")]
    Status(#[from] Status),
}
