// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver runtime transport: arenas, channels and callback dispatchers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + threaded integration tests
//!
//! PUBLIC API:
//!   - Arena / ArenaBytes: reference-counted payload storage shared across endpoints
//!   - Channel / UnownedChannel: linked endpoint pair with single-registration async reads
//!   - Dispatch trait: scheduling seam consumed by channels
//!   - Dispatcher: thread-pool dispatcher (synchronized or unsynchronized)
//!   - CallbackRequest: the one reusable callback slot owned by each endpoint
//!   - Handle: objects transferable through a channel
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - The channel pair lock is never held across a callback
//!   - Callbacks never run on the thread that writes, arms or closes a channel
//!   - Message ownership moves from writer to reader exactly once
//!
//! ERROR CONDITIONS:
//!   - Status::PeerClosed: the other endpoint is gone
//!   - Status::ShouldWait: nothing queued yet
//!   - Status::BadState: a read registration already exists or is executing, or
//!     the dispatcher has shut down
//!   - Status::InvalidArgs: payload not owned by the supplied arena
//!
//! DEPENDENCIES:
//!   - nexus-kobj: status codes and transferable kernel objects
//!   - parking_lot: pair lock and dispatcher queue
//!   - log: dispatcher lifecycle tracing
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod arena;
mod callback;
mod channel;
mod dispatcher;
mod handle;

pub use arena::{Arena, ArenaBytes};
pub use callback::{Callback, CallbackRequest, RequestId};
pub use channel::{Channel, Message, UnownedChannel};
pub use dispatcher::{Dispatch, Dispatcher, DispatcherOptions, BATCH_SIZE};
pub use handle::Handle;
pub use nexus_kobj::Status;

/// Result alias for driver runtime operations.
pub type Result<T> = core::result::Result<T, Status>;
