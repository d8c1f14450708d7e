// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deferred work-item runner for the driver host
//!
//! Drivers push closures from any thread, including from inside a running work
//! item. Items are drained by the event waiter on the host loop, at most
//! `max_per_wake` per wake-up, so nested pushes never grow the call stack.
//!
//! Draining swaps the whole live queue out under the lock and runs it without
//! the lock; anything not run before the cap is hit is spliced back in front
//! of whatever was pushed meanwhile. FIFO order per producer is preserved and
//! no item is dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};
use nexus_kobj::{Event, Signals};
use parking_lot::Mutex;

use crate::{Device, HostLoop, Result, Status};

struct WorkItem {
    device: Arc<Device>,
    callback: Box<dyn FnOnce() + Send>,
}

struct EventWaiter {
    event: Event,
    signaled: bool,
}

impl EventWaiter {
    fn signal(&mut self) {
        if let Err(status) = self.event.signal(Signals::empty(), Signals::USER_0) {
            warn!("driver_host: failed to signal work event: {status}");
            return;
        }
        self.signaled = true;
    }

    fn designal(&mut self) {
        if let Err(status) = self.event.signal(Signals::USER_0, Signals::empty()) {
            warn!("driver_host: failed to clear work event: {status}");
            return;
        }
        self.signaled = false;
    }
}

#[derive(Default)]
struct ContextState {
    waiter: Option<EventWaiter>,
    work_items: VecDeque<WorkItem>,
}

/// Process-wide driver host state. Clones share the same queue.
#[derive(Clone, Default)]
pub struct DriverHostContext {
    state: Arc<Mutex<ContextState>>,
}

impl DriverHostContext {
    /// Creates a context with an empty queue and no event waiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `callback` against `device` and wakes the event waiter.
    pub fn push_work_item<F>(&self, device: &Arc<Device>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        state.work_items.push_back(WorkItem { device: Arc::clone(device), callback: Box::new(callback) });
        trace!("driver_host: queued work for {}, depth {}", device.name(), state.work_items.len());
        if let Some(waiter) = state.waiter.as_mut() {
            if !waiter.signaled {
                waiter.signal();
            }
        }
    }

    /// Runs up to `max_count` queued items, or all of them when `max_count`
    /// is zero. Items pushed while running are included until the cap is
    /// reached.
    pub fn run_work_items(&self, max_count: usize) {
        {
            let mut state = self.state.lock();
            if let Some(waiter) = state.waiter.as_mut() {
                if waiter.signaled {
                    waiter.designal();
                }
            }
        }

        let mut remaining = max_count;
        loop {
            let mut batch = core::mem::take(&mut self.state.lock().work_items);
            if batch.is_empty() {
                break;
            }
            while let Some(item) = batch.pop_front() {
                trace!("driver_host: running work for {}", item.device.name());
                (item.callback)();
                if max_count != 0 {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            if !batch.is_empty() {
                let mut state = self.state.lock();
                batch.append(&mut state.work_items);
                state.work_items = batch;
                break;
            }
            if max_count != 0 && remaining == 0 {
                break;
            }
        }

        let mut state = self.state.lock();
        if !state.work_items.is_empty() {
            if let Some(waiter) = state.waiter.as_mut() {
                if !waiter.signaled {
                    waiter.signal();
                }
            }
        }
    }

    /// Number of items waiting to run.
    pub fn pending_work_items(&self) -> usize {
        self.state.lock().work_items.len()
    }

    /// Installs the event waiter on `host`. Each wake runs at most
    /// `max_per_wake` items (zero means all). Fails with `BadState` if a
    /// waiter is already installed.
    pub fn setup_event_waiter(&self, host: &HostLoop, max_per_wake: usize) -> Result<()> {
        let event = Event::create();
        {
            let mut state = self.state.lock();
            if state.waiter.is_some() {
                return Err(Status::BadState);
            }
            state.waiter = Some(EventWaiter { event: event.clone(), signaled: false });
        }
        if let Err(status) = self.arm_waiter(host, event, max_per_wake) {
            self.state.lock().waiter = None;
            return Err(status);
        }

        let mut state = self.state.lock();
        if !state.work_items.is_empty() {
            if let Some(waiter) = state.waiter.as_mut() {
                waiter.signal();
            }
        }
        debug!("driver_host: event waiter ready, {max_per_wake} item(s) per wake");
        Ok(())
    }

    fn arm_waiter(&self, host: &HostLoop, event: Event, max_per_wake: usize) -> Result<()> {
        let context = self.clone();
        let rearm = event.clone();
        host.begin_wait(&event, Signals::USER_0, move |host, result| match result {
            Ok(_) => {
                context.run_work_items(max_per_wake);
                if let Err(status) = context.arm_waiter(host, rearm, max_per_wake) {
                    warn!("driver_host: failed to re-arm event waiter: {status}");
                }
            }
            Err(status) => debug!("driver_host: event waiter stopped: {status}"),
        })
    }
}

impl core::fmt::Debug for DriverHostContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DriverHostContext")
            .field("pending", &state.work_items.len())
            .field("waiter", &state.waiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceFlags;

    fn device() -> Arc<Device> {
        Device::new("test-dev", 1, DeviceFlags::empty()).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |n: u32| -> Box<dyn FnOnce() + Send> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(n))
        };
        (log, make)
    }

    #[test]
    fn zero_cap_runs_everything_in_order() {
        let ctx = DriverHostContext::new();
        let dev = device();
        let (log, make) = recorder();
        for n in 0..5 {
            ctx.push_work_item(&dev, make(n));
        }
        ctx.run_work_items(0);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(ctx.pending_work_items(), 0);
    }

    #[test]
    fn cap_leaves_remainder_in_front() {
        let ctx = DriverHostContext::new();
        let dev = device();
        let (log, make) = recorder();
        for n in 0..5 {
            ctx.push_work_item(&dev, make(n));
        }
        ctx.run_work_items(2);
        assert_eq!(*log.lock(), vec![0, 1]);
        ctx.push_work_item(&dev, make(9));
        ctx.run_work_items(3);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        ctx.run_work_items(0);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4, 9]);
    }

    #[test]
    fn nested_pushes_run_after_earlier_items() {
        let ctx = DriverHostContext::new();
        let dev = device();
        let (log, make) = recorder();
        let inner_ctx = ctx.clone();
        let inner_dev = Arc::clone(&dev);
        let nested = make(100);
        let first = make(1);
        ctx.push_work_item(&dev, move || {
            first();
            inner_ctx.push_work_item(&inner_dev, nested);
        });
        ctx.push_work_item(&dev, make(2));
        ctx.run_work_items(0);
        assert_eq!(*log.lock(), vec![1, 2, 100]);
    }

    #[test]
    fn work_item_keeps_device_alive_until_run() {
        let ctx = DriverHostContext::new();
        let dev = device();
        ctx.push_work_item(&dev, || {});
        assert_eq!(Arc::strong_count(&dev), 2);
        ctx.run_work_items(0);
        assert_eq!(Arc::strong_count(&dev), 1);
    }

    #[test]
    fn event_waiter_drains_in_bounded_wakes() {
        let host = HostLoop::new();
        let ctx = DriverHostContext::new();
        let dev = device();
        let (log, make) = recorder();
        for n in 0..3 {
            ctx.push_work_item(&dev, make(n));
        }
        ctx.setup_event_waiter(&host, 2).unwrap();
        for n in 3..5 {
            ctx.push_work_item(&dev, make(n));
        }

        // Five items at two per wake: the waiter re-signals itself twice.
        assert_eq!(host.run_until_idle(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(ctx.pending_work_items(), 0);
        assert_eq!(host.pending_waits(), 1, "waiter stays armed");
    }

    #[test]
    fn second_waiter_is_rejected() {
        let host = HostLoop::new();
        let ctx = DriverHostContext::new();
        ctx.setup_event_waiter(&host, 0).unwrap();
        assert_eq!(ctx.setup_event_waiter(&host, 0).unwrap_err(), Status::BadState);
    }
}
