// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Signalable objects (Event, EventPair) and one-shot async waits
//!
//! An async wait is armed with an observer, a key and a trigger mask. It fires
//! exactly once, the first time any trigger signal is asserted (immediately if
//! one already is), and is then removed. Observers are always invoked with no
//! object lock held so they may touch other objects freely.
//!
//! Dropping one side of an [`EventPair`] asserts [`Signals::PEER_CLOSED`] on the
//! other side and discards the waits armed on the dropped side.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::{Koid, Result, Signals, Status};

/// Receives signal notifications from fired async waits.
pub trait SignalObserver: Send + Sync {
    /// Called once per fired wait, outside any object lock.
    fn on_signal(&self, key: u64, trigger: Signals, observed: Signals);
}

/// Objects that support one-shot async waits.
pub trait Waitable {
    /// Object identifier.
    fn koid(&self) -> Koid;

    /// Currently asserted signals.
    fn signals(&self) -> Signals;

    /// Arms a one-shot wait that notifies `observer` when any of `trigger` is asserted.
    fn wait_async(&self, observer: Arc<dyn SignalObserver>, key: u64, trigger: Signals)
        -> Result<()>;

    /// Removes a not-yet-fired wait. Returns `false` if none matched `key`.
    fn cancel_wait(&self, key: u64) -> bool;
}

struct PendingWait {
    observer: Arc<dyn SignalObserver>,
    key: u64,
    trigger: Signals,
}

struct Fired {
    observer: Arc<dyn SignalObserver>,
    key: u64,
    trigger: Signals,
    observed: Signals,
}

impl Fired {
    fn deliver(self) {
        self.observer.on_signal(self.key, self.trigger, self.observed);
    }
}

#[derive(Default)]
struct ObjectState {
    signals: Signals,
    waits: Vec<PendingWait>,
}

impl Default for Signals {
    fn default() -> Self {
        Signals::empty()
    }
}

impl ObjectState {
    fn update(&mut self, clear: Signals, set: Signals) -> Vec<Fired> {
        self.signals = self.signals.difference(clear).union(set);
        self.collect_fired()
    }

    fn collect_fired(&mut self) -> Vec<Fired> {
        let signals = self.signals;
        let mut fired = Vec::new();
        self.waits.retain(|wait| {
            if wait.trigger.intersects(signals) {
                fired.push(Fired {
                    observer: Arc::clone(&wait.observer),
                    key: wait.key,
                    trigger: wait.trigger,
                    observed: signals,
                });
                false
            } else {
                true
            }
        });
        fired
    }

    fn arm(&mut self, observer: Arc<dyn SignalObserver>, key: u64, trigger: Signals) -> Option<Fired> {
        if trigger.intersects(self.signals) {
            return Some(Fired { observer, key, trigger, observed: self.signals });
        }
        self.waits.push(PendingWait { observer, key, trigger });
        None
    }

    fn cancel(&mut self, key: u64) -> bool {
        let before = self.waits.len();
        self.waits.retain(|wait| wait.key != key);
        before != self.waits.len()
    }
}

fn check_user_mask(clear: Signals, set: Signals) -> Result<()> {
    if !Signals::USER_ALL.contains(clear | set) {
        return Err(Status::InvalidArgs);
    }
    Ok(())
}

/// A user-signalable object. Clones refer to the same object.
#[derive(Clone)]
pub struct Event {
    koid: Koid,
    state: Arc<Mutex<ObjectState>>,
}

impl Event {
    /// Creates an event with no signals asserted.
    pub fn create() -> Self {
        Self { koid: Koid::next(), state: Arc::new(Mutex::new(ObjectState::default())) }
    }

    /// Clears `clear` then asserts `set`. Only user signals may be changed.
    pub fn signal(&self, clear: Signals, set: Signals) -> Result<()> {
        check_user_mask(clear, set)?;
        let fired = self.state.lock().update(clear, set);
        fired.into_iter().for_each(Fired::deliver);
        Ok(())
    }
}

impl Waitable for Event {
    fn koid(&self) -> Koid {
        self.koid
    }

    fn signals(&self) -> Signals {
        self.state.lock().signals
    }

    fn wait_async(
        &self,
        observer: Arc<dyn SignalObserver>,
        key: u64,
        trigger: Signals,
    ) -> Result<()> {
        let fired = self.state.lock().arm(observer, key, trigger);
        if let Some(fired) = fired {
            fired.deliver();
        }
        Ok(())
    }

    fn cancel_wait(&self, key: u64) -> bool {
        self.state.lock().cancel(key)
    }
}

struct PairShared {
    koids: [Koid; 2],
    sides: Mutex<PairSides>,
}

struct PairSides {
    state: [ObjectState; 2],
    open: [bool; 2],
}

/// One side of a linked pair of events.
pub struct EventPair {
    shared: Arc<PairShared>,
    side: usize,
}

impl EventPair {
    /// Creates a linked pair.
    pub fn create() -> (EventPair, EventPair) {
        let shared = Arc::new(PairShared {
            koids: [Koid::next(), Koid::next()],
            sides: Mutex::new(PairSides {
                state: [ObjectState::default(), ObjectState::default()],
                open: [true, true],
            }),
        });
        (
            EventPair { shared: Arc::clone(&shared), side: 0 },
            EventPair { shared, side: 1 },
        )
    }

    /// Identifier of the other side.
    pub fn peer_koid(&self) -> Koid {
        self.shared.koids[1 - self.side]
    }

    /// Changes user signals on this side.
    pub fn signal(&self, clear: Signals, set: Signals) -> Result<()> {
        check_user_mask(clear, set)?;
        let fired = self.shared.sides.lock().state[self.side].update(clear, set);
        fired.into_iter().for_each(Fired::deliver);
        Ok(())
    }

    /// Changes user signals on the other side.
    pub fn signal_peer(&self, clear: Signals, set: Signals) -> Result<()> {
        check_user_mask(clear, set)?;
        let peer = 1 - self.side;
        let fired = {
            let mut sides = self.shared.sides.lock();
            if !sides.open[peer] {
                return Err(Status::PeerClosed);
            }
            sides.state[peer].update(clear, set)
        };
        fired.into_iter().for_each(Fired::deliver);
        Ok(())
    }

    /// Returns `true` once the other side has been dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.signals().contains(Signals::PEER_CLOSED)
    }
}

impl Waitable for EventPair {
    fn koid(&self) -> Koid {
        self.shared.koids[self.side]
    }

    fn signals(&self) -> Signals {
        self.shared.sides.lock().state[self.side].signals
    }

    fn wait_async(
        &self,
        observer: Arc<dyn SignalObserver>,
        key: u64,
        trigger: Signals,
    ) -> Result<()> {
        let fired = self.shared.sides.lock().state[self.side].arm(observer, key, trigger);
        if let Some(fired) = fired {
            fired.deliver();
        }
        Ok(())
    }

    fn cancel_wait(&self, key: u64) -> bool {
        self.shared.sides.lock().state[self.side].cancel(key)
    }
}

impl Drop for EventPair {
    fn drop(&mut self) {
        let peer = 1 - self.side;
        trace!("eventpair {}: closed", self.koid().raw());
        let fired = {
            let mut sides = self.shared.sides.lock();
            sides.open[self.side] = false;
            sides.state[self.side].waits.clear();
            if sides.open[peer] {
                sides.state[peer].update(Signals::empty(), Signals::PEER_CLOSED)
            } else {
                Vec::new()
            }
        };
        fired.into_iter().for_each(Fired::deliver);
    }
}

impl core::fmt::Debug for EventPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPair").field("koid", &self.koid()).finish()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event").field("koid", &self.koid).finish()
    }
}
