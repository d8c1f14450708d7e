// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host emulation of the kernel object primitives used by the driver framework
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per object type
//!
//! PUBLIC API:
//!   - Status: kernel status codes returned by every driver-framework operation
//!   - Signals: observable object signals (user, peer-closed)
//!   - Event / EventPair: signalable objects with one-shot async waits
//!   - Port: packet queue used by event loops and workers
//!   - Resource: capability scoped to an I/O port or MMIO range
//!
//! DEPENDENCIES:
//!   - parking_lot: object state locks and the port condition variable
//!   - bitflags: signal masks
//!   - thiserror: status code error type
//!   - log: object lifecycle tracing
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod object;
mod port;
mod resource;

pub use object::{Event, EventPair, SignalObserver, Waitable};
pub use port::{Packet, PacketKind, Port};
pub use resource::{Resource, ResourceKind};

use core::sync::atomic::{AtomicU64, Ordering};

/// Result alias for kernel object operations.
pub type Result<T> = core::result::Result<T, Status>;

/// Status codes shared by the kernel object layer and the driver framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    /// Unexpected internal failure.
    #[error("internal error")]
    Internal,
    /// Operation is not supported on this object.
    #[error("operation not supported")]
    NotSupported,
    /// A resource limit was reached.
    #[error("no resources")]
    NoResources,
    /// Memory could not be allocated.
    #[error("no memory")]
    NoMemory,
    /// Caller supplied invalid arguments.
    #[error("invalid arguments")]
    InvalidArgs,
    /// The handle refers to a closed object.
    #[error("bad handle")]
    BadHandle,
    /// The object is not in a state that allows the operation.
    #[error("bad state")]
    BadState,
    /// The deadline passed before the operation completed.
    #[error("timed out")]
    TimedOut,
    /// Nothing is available yet; try again after waiting.
    #[error("should wait")]
    ShouldWait,
    /// The operation was canceled.
    #[error("canceled")]
    Canceled,
    /// The other side of a paired object is gone.
    #[error("peer closed")]
    PeerClosed,
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// The requested entity already exists.
    #[error("already exists")]
    AlreadyExists,
    /// An argument is outside the valid range.
    #[error("out of range")]
    OutOfRange,
}

bitflags::bitflags! {
    /// Signals observable on kernel objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u32 {
        /// Object has data to read.
        const READABLE = 1 << 0;
        /// The linked peer object was closed.
        const PEER_CLOSED = 1 << 2;
        /// User-controlled signal 0.
        const USER_0 = 1 << 24;
        /// User-controlled signal 1.
        const USER_1 = 1 << 25;
    }
}

impl Signals {
    /// Signals that callers may set or clear directly.
    pub const USER_ALL: Signals = Signals::USER_0.union(Signals::USER_1);
}

/// Kernel object identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Koid(u64);

impl Koid {
    /// Allocates the next object identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn raw(self) -> u64 {
        self.0
    }
}
