// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Port-backed host event loop with one-shot waits
//!
//! `begin_wait` arms a one-shot wait on a kernel object; the signal packet
//! lands on the loop's port and the registered handler runs on whichever
//! thread is draining the loop. Handlers never run with a loop lock held, so
//! they may re-arm or quit freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use nexus_kobj::{Packet, PacketKind, Port, SignalObserver, Signals, Waitable};
use parking_lot::Mutex;

use crate::{Result, Status};

/// Handler invoked once per wait with the observed signals or `Canceled`.
pub type WaitHandler = Box<dyn FnOnce(&HostLoop, Result<Signals>) + Send>;

// Keys below this value are reserved for control packets.
const QUIT_KEY: u64 = 0;
const FIRST_WAIT_KEY: u64 = 1;

/// Event loop shared by clone.
#[derive(Clone)]
pub struct HostLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    port: Port,
    next_key: AtomicU64,
    state: Mutex<LoopState>,
}

#[derive(Default)]
struct LoopState {
    waits: HashMap<u64, WaitHandler>,
    quit: bool,
    shut_down: bool,
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLoop {
    /// Creates an idle loop.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopInner {
                port: Port::create(),
                next_key: AtomicU64::new(FIRST_WAIT_KEY),
                state: Mutex::new(LoopState::default()),
            }),
        }
    }

    /// Arms a one-shot wait for any of `signals` on `object`.
    pub fn begin_wait<W, F>(&self, object: &W, signals: Signals, handler: F) -> Result<()>
    where
        W: Waitable + ?Sized,
        F: FnOnce(&HostLoop, Result<Signals>) + Send + 'static,
    {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(Status::BadState);
            }
            state.waits.insert(key, Box::new(handler));
        }
        let observer: Arc<dyn SignalObserver> = Arc::new(self.inner.port.clone());
        if let Err(status) = object.wait_async(observer, key, signals) {
            self.inner.state.lock().waits.remove(&key);
            return Err(status);
        }
        trace!("host_loop: wait {key} armed on object {}", object.koid().raw());
        Ok(())
    }

    /// Number of armed waits.
    pub fn pending_waits(&self) -> usize {
        self.inner.state.lock().waits.len()
    }

    /// Runs every handler whose packet is already queued, without blocking.
    /// Returns the number of handlers run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Ok(packet) = self.inner.port.try_wait() {
            if self.dispatch(packet) {
                ran += 1;
            }
        }
        ran
    }

    /// Runs handlers as packets arrive, for at most `timeout`. Returns the
    /// number of handlers run.
    pub fn run_for(&self, timeout: Duration) -> usize {
        let deadline = std::time::Instant::now() + timeout;
        let mut ran = 0;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.inner.port.wait(Some(remaining)) {
                Ok(packet) => {
                    if self.dispatch(packet) {
                        ran += 1;
                    }
                }
                Err(_) => return ran,
            }
        }
    }

    /// Runs handlers until [`HostLoop::quit`] is called.
    pub fn run(&self) {
        loop {
            if self.inner.state.lock().quit {
                return;
            }
            match self.inner.port.wait(None) {
                Ok(packet) => {
                    self.dispatch(packet);
                }
                Err(status) => {
                    warn!("host_loop: port wait failed: {status}");
                    return;
                }
            }
        }
    }

    /// Makes `run` return once the current handler finishes.
    pub fn quit(&self) {
        self.inner.state.lock().quit = true;
        self.inner.port.queue(Packet::user(QUIT_KEY, 0));
    }

    /// Clears a previous `quit` so the loop can be run again.
    pub fn reset_quit(&self) {
        self.inner.state.lock().quit = false;
    }

    /// Runs the loop on a new named thread until `quit` or `shutdown`.
    pub fn start_thread(&self, name: &str) -> Result<JoinHandle<()>> {
        let this = self.clone();
        thread::Builder::new().name(name.to_string()).spawn(move || this.run()).map_err(|err| {
            warn!("host_loop: failed to spawn {name}: {err}");
            Status::NoResources
        })
    }

    /// Cancels every armed wait with `Canceled` and stops the loop. Later
    /// `begin_wait` calls fail with `BadState`.
    pub fn shutdown(&self) {
        let waits: Vec<WaitHandler> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.waits.drain().map(|(_, handler)| handler).collect()
        };
        debug!("host_loop: shutting down, cancelling {} wait(s)", waits.len());
        for handler in waits {
            handler(self, Err(Status::Canceled));
        }
        self.quit();
    }

    fn dispatch(&self, packet: Packet) -> bool {
        match packet.kind {
            PacketKind::Signal { observed, .. } => {
                let handler = self.inner.state.lock().waits.remove(&packet.key);
                match handler {
                    Some(handler) => {
                        handler(self, Ok(observed));
                        true
                    }
                    None => {
                        trace!("host_loop: dropping packet for cancelled wait {}", packet.key);
                        false
                    }
                }
            }
            PacketKind::User(_) if packet.key == QUIT_KEY => false,
            PacketKind::User(payload) => {
                warn!("host_loop: unexpected user packet key={} payload={payload}", packet.key);
                false
            }
        }
    }
}

impl core::fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostLoop").field("pending_waits", &self.pending_waits()).finish()
    }
}
