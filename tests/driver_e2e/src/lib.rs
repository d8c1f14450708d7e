// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver framework end-to-end test harness
//! INTENT: Shared fixtures for channel, work-runner and root host integration
//! DEPS: nexus-driver-runtime, nexus-driver-host, nexus-pci-root
//! TESTS: Channel-driven work items, window tokens carried over channels

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_driver_host::{DriverHostContext, HostLoop};
use nexus_driver_runtime::{Arena, Dispatcher, DispatcherOptions, Handle, UnownedChannel};
use nexus_kobj::Resource;
use nexus_pci_root::{PciRootHost, RangeConfig, RootHostConfig, Status};

/// Bounded wait used by every scenario.
pub const WAIT: Duration = Duration::from_secs(5);

/// A host loop on its own thread with a work runner attached.
pub struct HostFixture {
    /// The loop.
    pub host_loop: HostLoop,
    /// Work runner drained by the loop.
    pub context: DriverHostContext,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HostFixture {
    /// Starts a loop thread draining at most `per_wake` items per wake.
    pub fn start(per_wake: usize) -> Self {
        let host_loop = HostLoop::new();
        let context = DriverHostContext::new();
        context.setup_event_waiter(&host_loop, per_wake).unwrap();
        let thread = host_loop.start_thread("e2e-host-loop").unwrap();
        Self { host_loop, context, thread: Some(thread) }
    }
}

impl Drop for HostFixture {
    fn drop(&mut self) {
        self.host_loop.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A synchronized dispatcher named after the test.
pub fn dispatcher(name: &str) -> Arc<Dispatcher> {
    Dispatcher::create(DispatcherOptions::synchronized(name)).unwrap()
}

/// Root host with a single MMIO32 pool.
pub fn mmio32_root_host(base: u64, size: u64) -> PciRootHost {
    let config = RootHostConfig { mmio32: vec![RangeConfig { base, size }], ..Default::default() };
    PciRootHost::new(Resource::root(), &config).unwrap()
}

/// Writes `bytes` plus `handles` from a fresh arena.
pub fn send(channel: &UnownedChannel, bytes: &[u8], handles: Vec<Handle>) -> Result<(), Status> {
    let arena = Arena::create("e2e");
    let data = (!bytes.is_empty()).then(|| arena.alloc_copy(bytes));
    channel.write(Some(&arena), data, handles)
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
