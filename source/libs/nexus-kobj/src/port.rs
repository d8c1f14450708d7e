// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Port emulation: a packet queue with blocking waits
//!
//! Ports receive user packets queued explicitly and signal packets produced by
//! one-shot async waits on other objects. Packets are delivered in queue order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Result, SignalObserver, Signals, Status};

/// Payload carried by a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Packet queued by a user with an opaque payload.
    User(u64),
    /// Packet produced by an async wait whose trigger was satisfied.
    Signal {
        /// Signals the wait was armed for.
        trigger: Signals,
        /// Signals asserted on the object when the wait fired.
        observed: Signals,
    },
}

/// A packet delivered through a [`Port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Key supplied when the packet or wait was queued.
    pub key: u64,
    /// Packet payload.
    pub kind: PacketKind,
}

impl Packet {
    /// Builds a user packet.
    pub fn user(key: u64, payload: u64) -> Self {
        Self { key, kind: PacketKind::User(payload) }
    }
}

/// Cloneable handle to a packet queue.
#[derive(Clone, Default)]
pub struct Port {
    inner: Arc<PortInner>,
}

#[derive(Default)]
struct PortInner {
    queue: Mutex<VecDeque<Packet>>,
    available: Condvar,
}

impl Port {
    /// Creates an empty port.
    pub fn create() -> Self {
        Self::default()
    }

    /// Appends `packet` and wakes one waiter.
    pub fn queue(&self, packet: Packet) {
        self.inner.queue.lock().push_back(packet);
        self.inner.available.notify_one();
    }

    /// Waits for the next packet. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Packet> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(packet) = queue.pop_front() {
                return Ok(packet);
            }
            match deadline {
                None => self.inner.available.wait(&mut queue),
                Some(deadline) => {
                    if self.inner.available.wait_until(&mut queue, deadline).timed_out()
                        && queue.is_empty()
                    {
                        return Err(Status::TimedOut);
                    }
                }
            }
        }
    }

    /// Pops the next packet without blocking.
    pub fn try_wait(&self) -> Result<Packet> {
        self.inner.queue.lock().pop_front().ok_or(Status::ShouldWait)
    }

    /// Number of undelivered packets.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl SignalObserver for Port {
    fn on_signal(&self, key: u64, trigger: Signals, observed: Signals) {
        self.queue(Packet { key, kind: PacketKind::Signal { trigger, observed } });
    }
}
