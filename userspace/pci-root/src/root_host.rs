// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: PCI root host window allocator with lifetime-tracked reclamation
//!
//! Every window handed out is paired with an event pair. The caller keeps one
//! side; the host retains the other together with the allocated region. When
//! the caller's side goes away, the retained side observes `PEER_CLOSED` and
//! the region is returned to its pool. There is no explicit free.
//!
//! A single worker thread owns the allocation map. Allocation requests,
//! peer-closure notices, sync barriers and shutdown all travel through one
//! FIFO inbox, so an allocation is only attempted after every closure
//! notified before it has been reclaimed.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, log_enabled, trace, Level};
use nexus_kobj::{EventPair, Resource, ResourceKind, SignalObserver, Signals, Waitable};
use parking_lot::Mutex;

use crate::{Region, RegionAllocator, RegionSpan, Result, RootHostConfig, Status};

const MAIN_TAG: &str = "RootHost:";
const WORKER_TAG: &str = "RootHostWorker:";

/// Address space a window is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// x86 I/O ports.
    Io,
    /// MMIO below 4 GiB.
    Mmio32,
    /// MMIO anywhere.
    Mmio64,
}

impl AllocationType {
    fn label(self) -> &'static str {
        match self {
            AllocationType::Io => "Io",
            AllocationType::Mmio32 => "Mmio32",
            AllocationType::Mmio64 => "Mmio64",
        }
    }

    fn resource_kind(self) -> ResourceKind {
        match self {
            AllocationType::Io => ResourceKind::IoPort,
            AllocationType::Mmio32 | AllocationType::Mmio64 => ResourceKind::Mmio,
        }
    }
}

/// An ECAM window described by the firmware MCFG table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McfgAllocation {
    /// ECAM base address.
    pub address: u64,
    /// PCI segment group.
    pub pci_segment: u16,
    /// First decoded bus.
    pub start_bus_number: u8,
    /// Last decoded bus.
    pub end_bus_number: u8,
}

type AllocationReply = Sender<Result<(Resource, EventPair)>>;

enum WorkerMessage {
    Allocate { kind: AllocationType, base: u64, size: u64, reply: AllocationReply },
    PeerClosed { key: u64 },
    Sync { ack: Sender<usize> },
    Exit,
}

/// Forwards peer-closure signals into the worker inbox.
struct WorkerInbox {
    sender: Mutex<Sender<WorkerMessage>>,
}

impl SignalObserver for WorkerInbox {
    fn on_signal(&self, key: u64, _trigger: Signals, observed: Signals) {
        if !observed.contains(Signals::PEER_CLOSED) {
            error!("{WORKER_TAG} unexpected signals {observed:?} for allocation {key}");
            return;
        }
        // A send error means the worker already exited and dropped the record.
        let _ = self.sender.lock().send(WorkerMessage::PeerClosed { key });
    }
}

struct WindowAllocation {
    // Held only for its peer-closure tracking.
    _host_peer: EventPair,
    region: Region,
}

impl Drop for WindowAllocation {
    fn drop(&mut self) {
        debug!(
            "{WORKER_TAG} releasing [{:#x} - {:#x}]",
            self.region.base(),
            self.region.base() + self.region.size()
        );
    }
}

#[derive(Clone)]
struct Pools {
    io: RegionAllocator,
    mmio32: RegionAllocator,
    mmio64: RegionAllocator,
}

impl Pools {
    fn get(&self, kind: AllocationType) -> &RegionAllocator {
        match kind {
            AllocationType::Io => &self.io,
            AllocationType::Mmio32 => &self.mmio32,
            AllocationType::Mmio64 => &self.mmio64,
        }
    }
}

struct Worker {
    root_resource: Resource,
    pools: Pools,
    inbox: Arc<WorkerInbox>,
    allocations: HashMap<u64, WindowAllocation>,
    alloc_key_cnt: u64,
}

impl Worker {
    fn run(mut self, receiver: Receiver<WorkerMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                WorkerMessage::Allocate { kind, base, size, reply } => {
                    let result = self.allocate(kind, base, size);
                    // The requester may have given up; the pair then closes and reclaims itself.
                    let _ = reply.send(result);
                }
                WorkerMessage::PeerClosed { key } => {
                    if self.allocations.remove(&key).is_none() {
                        trace!("{WORKER_TAG} allocation {key} already released");
                    }
                }
                WorkerMessage::Sync { ack } => {
                    let _ = ack.send(self.allocations.len());
                }
                WorkerMessage::Exit => {
                    trace!("{WORKER_TAG} received exit signal");
                    return;
                }
            }
        }
    }

    fn allocate(&mut self, kind: AllocationType, base: u64, size: u64) -> Result<(Resource, EventPair)> {
        let pool = self.pools.get(kind);
        let region = if base != 0 { pool.get_region_exact(base, size) } else { pool.get_region(size) };
        let region = match region {
            Ok(region) => region,
            Err(status) => {
                trace!(
                    "{MAIN_TAG} failed to allocate {} {:#x}-{:#x}: {status}",
                    kind.label(),
                    base,
                    base.saturating_add(size)
                );
                if log_enabled!(Level::Trace) {
                    trace!("{MAIN_TAG} Regions available:");
                    for span in pool.available_regions() {
                        trace!("    {:#x} - {:#x}", span.base, span.end());
                    }
                }
                return Err(status);
            }
        };

        let name = format!("PCI {}", kind.label());
        let resource = Resource::create(
            &self.root_resource,
            kind.resource_kind(),
            region.base(),
            region.size(),
            &name,
            true,
        )?;
        let (base, size) = (region.base(), region.size());
        let endpoint = self.record_allocation(region)?;
        trace!("{MAIN_TAG} assigned {} {:#x}-{:#x} to PciRoot", kind.label(), base, base + size);
        Ok((resource, endpoint))
    }

    fn record_allocation(&mut self, region: Region) -> Result<EventPair> {
        let (host_peer, out_endpoint) = EventPair::create();
        self.alloc_key_cnt += 1;
        let key = self.alloc_key_cnt;
        let observer: Arc<dyn SignalObserver> = self.inbox.clone();
        if let Err(status) = host_peer.wait_async(observer, key, Signals::PEER_CLOSED) {
            trace!("{MAIN_TAG} failed to set up tracking for resource allocation: {status}");
            return Err(status);
        }
        self.allocations.insert(key, WindowAllocation { _host_peer: host_peer, region });
        Ok(out_endpoint)
    }
}

/// Hands out disjoint I/O and MMIO windows and reclaims them when their
/// holder goes away.
pub struct PciRootHost {
    root_resource: Resource,
    pools: Pools,
    mcfgs: Vec<McfgAllocation>,
    inbox: Sender<WorkerMessage>,
    worker: Option<JoinHandle<()>>,
}

impl PciRootHost {
    /// Builds the pools from `config` and starts the reclamation worker.
    pub fn new(root_resource: Resource, config: &RootHostConfig) -> Result<Self> {
        if root_resource.kind() != ResourceKind::Root {
            return Err(Status::InvalidArgs);
        }
        let pools = Pools {
            io: RegionAllocator::new("PCI Io"),
            mmio32: RegionAllocator::new("PCI Mmio32"),
            mmio64: RegionAllocator::new("PCI Mmio64"),
        };
        for (pool, ranges) in
            [(&pools.io, &config.io), (&pools.mmio32, &config.mmio32), (&pools.mmio64, &config.mmio64)]
        {
            for range in ranges {
                pool.add_region(range.base, range.size)?;
            }
        }

        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            root_resource: root_resource.clone(),
            pools: pools.clone(),
            inbox: Arc::new(WorkerInbox { sender: Mutex::new(sender.clone()) }),
            allocations: HashMap::new(),
            alloc_key_cnt: 0,
        };
        let handle = thread::Builder::new()
            .name("pci-root-host".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|err| {
                error!("{MAIN_TAG} failed to start worker: {err}");
                Status::NoResources
            })?;

        Ok(Self {
            root_resource,
            pools,
            mcfgs: config.mcfg.iter().copied().map(McfgAllocation::from).collect(),
            inbox: sender,
            worker: Some(handle),
        })
    }

    /// Root resource windows are minted from.
    pub fn root_resource(&self) -> &Resource {
        &self.root_resource
    }

    /// Allocates a window of `size` from the `kind` pool.
    ///
    /// A non-zero `base` requests exactly `[base, base + size)`; otherwise any
    /// free range is used. The returned event pair side tracks the lifetime of
    /// the window: dropping it returns the range to the pool.
    pub fn allocate_window(
        &self,
        kind: AllocationType,
        base: u64,
        size: u64,
    ) -> Result<(Resource, EventPair)> {
        if size == 0 {
            return Err(Status::InvalidArgs);
        }
        let (reply, response) = mpsc::channel();
        self.send(WorkerMessage::Allocate { kind, base, size, reply })?;
        response.recv().map_err(|_| {
            error!("{MAIN_TAG} worker dropped allocation request");
            Status::Internal
        })?
    }

    /// Allocates an I/O port window.
    pub fn allocate_io_window(&self, base: u64, size: u64) -> Result<(Resource, EventPair)> {
        self.allocate_window(AllocationType::Io, base, size)
    }

    /// Allocates a window below 4 GiB.
    pub fn allocate_mmio32_window(&self, base: u64, size: u64) -> Result<(Resource, EventPair)> {
        self.allocate_window(AllocationType::Mmio32, base, size)
    }

    /// Allocates a window anywhere in the 64-bit space.
    pub fn allocate_mmio64_window(&self, base: u64, size: u64) -> Result<(Resource, EventPair)> {
        self.allocate_window(AllocationType::Mmio64, base, size)
    }

    /// Blocks until the worker has handled every message queued before this
    /// call, including peer-closure notices.
    pub fn wait_for_worker_ack(&self) -> Result<()> {
        self.sync().map(|_| ())
    }

    /// Number of live window allocations, after a sync barrier.
    pub fn allocation_count(&self) -> Result<usize> {
        self.sync()
    }

    /// Free ranges of the `kind` pool.
    pub fn available_regions(&self, kind: AllocationType) -> Vec<RegionSpan> {
        self.pools.get(kind).available_regions()
    }

    /// The pool backing `kind`.
    pub fn pool(&self, kind: AllocationType) -> &RegionAllocator {
        self.pools.get(kind)
    }

    /// MCFG entries known to the host.
    pub fn mcfgs(&self) -> &[McfgAllocation] {
        &self.mcfgs
    }

    /// Returns the MCFG entry for `segment`. A segment group has at most one
    /// entry, so the first match wins.
    pub fn get_segment_mcfg_allocation(&self, segment: u16) -> Result<McfgAllocation> {
        self.mcfgs.iter().find(|entry| entry.pci_segment == segment).copied().ok_or(Status::NotFound)
    }

    fn sync(&self) -> Result<usize> {
        let (ack, acked) = mpsc::channel();
        self.send(WorkerMessage::Sync { ack })?;
        let count = acked.recv().map_err(|_| {
            error!("{MAIN_TAG} worker exited before acknowledging");
            Status::Internal
        })?;
        trace!("{MAIN_TAG} received ack");
        Ok(count)
    }

    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.inbox.send(message).map_err(|_| {
            error!("{MAIN_TAG} worker is not running");
            Status::BadState
        })
    }
}

impl Drop for PciRootHost {
    fn drop(&mut self) {
        let _ = self.inbox.send(WorkerMessage::Exit);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{MAIN_TAG} worker panicked");
            }
        }
    }
}

impl core::fmt::Debug for PciRootHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciRootHost")
            .field("io", &self.pools.io)
            .field("mmio32", &self.pools.mmio32)
            .field("mmio64", &self.pools.mmio64)
            .field("mcfgs", &self.mcfgs)
            .finish()
    }
}
