// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: PCI root host: bus address-space pools with leak-proof window tracking
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests in tests/
//!
//! PUBLIC API:
//!   - PciRootHost: allocates I/O and MMIO windows paired with lifetime tokens
//!   - RegionAllocator / Region: first-fit address pools with coalescing
//!   - RootHostConfig: TOML description of the pools and MCFG table
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Outstanding windows of one pool never overlap
//!   - A window returns to its pool once its lifetime token is dropped
//!
//! DEPENDENCIES:
//!   - nexus-kobj: resources, event pairs, status codes
//!   - parking_lot: pool state lock
//!   - serde/toml: configuration
//!   - thiserror: config errors
//!   - log: allocation tracing
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod config;
mod region;
mod root_host;

pub use config::{
    ConfigError, McfgConfig, RangeConfig, RootHostConfig, IO_SPACE_LIMIT, MMIO32_SPACE_LIMIT,
};
pub use nexus_kobj::Status;
pub use region::{Region, RegionAllocator, RegionSpan};
pub use root_host::{AllocationType, McfgAllocation, PciRootHost};

/// Result alias for root host operations.
pub type Result<T> = core::result::Result<T, Status>;
