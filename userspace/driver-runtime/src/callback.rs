// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Callback requests handed between channel endpoints and dispatchers
//!
//! A request is a reusable slot: the owner arms it with a callback and a
//! reason, gives it to a dispatcher, and receives it back as the first
//! argument when the dispatcher invokes it.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

/// Identifies a request for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Function run by a dispatcher. Receives the request back plus the reason.
pub type Callback = Box<dyn FnOnce(CallbackRequest, Result<()>) + Send>;

/// Reusable callback slot.
pub struct CallbackRequest {
    id: RequestId,
    callback: Option<Callback>,
    reason: Result<()>,
}

impl Default for CallbackRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRequest {
    /// Creates an unarmed request.
    pub fn new() -> Self {
        Self { id: RequestId::next(), callback: None, reason: Ok(()) }
    }

    /// Stable identifier of this slot.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Arms the request.
    pub fn set_callback(&mut self, callback: Callback, reason: Result<()>) {
        self.callback = Some(callback);
        self.reason = reason;
    }

    /// Overrides the reason the callback will observe.
    pub fn set_reason(&mut self, reason: Result<()>) {
        self.reason = reason;
    }

    /// Reason the callback will observe.
    pub fn reason(&self) -> Result<()> {
        self.reason
    }

    /// Returns `true` while a callback is armed.
    pub fn is_pending(&self) -> bool {
        self.callback.is_some()
    }

    /// Runs the armed callback, if any, handing the slot back to it.
    pub fn call(mut self) {
        if let Some(callback) = self.callback.take() {
            let reason = self.reason;
            callback(self, reason);
        }
    }
}

impl core::fmt::Debug for CallbackRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackRequest")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .field("reason", &self.reason)
            .finish()
    }
}
