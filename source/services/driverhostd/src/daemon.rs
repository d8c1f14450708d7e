// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver host daemon state and driver binding
//!
//! Discovered drivers are bound from a work item on the host loop. Binding
//! creates the driver's device record and a control channel whose host end is
//! served by the driver dispatcher.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace};
use nexus_driver_host::{
    find_drivers, Device, DeviceFlags, Driver, DriverHostContext, HostLoop, ManifestLoader,
};
use nexus_driver_runtime::{Channel, Dispatch, Dispatcher, DispatcherOptions, UnownedChannel};
use nexus_kobj::{Resource, Status};
use nexus_pci_root::PciRootHost;
use parking_lot::Mutex;

use crate::{DaemonConfig, DaemonError};

/// A driver bound into this host.
#[derive(Debug)]
pub struct BoundDriver {
    device: Arc<Device>,
    manifest: PathBuf,
    control: Channel,
    _host_end: Channel,
    received: Arc<AtomicUsize>,
}

impl BoundDriver {
    /// Device record created for the driver.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Manifest the driver was loaded from.
    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    /// Driver side of the control channel.
    pub fn control(&self) -> UnownedChannel {
        self.control.unowned()
    }

    /// Control messages the host has consumed so far.
    pub fn messages_received(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }
}

/// Running driver host.
pub struct Daemon {
    config: DaemonConfig,
    host_loop: HostLoop,
    context: DriverHostContext,
    dispatcher: Arc<Dispatcher>,
    root_host: Option<PciRootHost>,
    bound: Arc<Mutex<Vec<BoundDriver>>>,
}

impl Daemon {
    /// Builds the loop, work runner, dispatcher and, when pools are
    /// configured, the PCI root host.
    pub fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        let host = &config.host;
        info!(
            "driver_host: starting ({} dispatcher threads, {} work items per wake)",
            host.dispatcher_threads, host.work_items_per_wake
        );
        let host_loop = HostLoop::new();
        let context = DriverHostContext::new();
        context.setup_event_waiter(&host_loop, host.work_items_per_wake)?;

        let options = if host.dispatcher_threads > 1 {
            DispatcherOptions::unsynchronized("driver-host", host.dispatcher_threads)
        } else {
            DispatcherOptions::synchronized("driver-host")
        };
        let dispatcher = Dispatcher::create(options)?;

        let root_host = if config.wants_root_host() {
            Some(PciRootHost::new(Resource::root(), &config.root_host)?)
        } else {
            debug!("driver_host: no root host pools configured");
            None
        };

        Ok(Self {
            config,
            host_loop,
            context,
            dispatcher,
            root_host,
            bound: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Scans the configured driver directory, queuing one bind work item per
    /// driver found. Returns the number of drivers queued.
    pub fn discover(&self) -> Result<usize, DaemonError> {
        let Some(dir) = self.config.host.driver_dir.clone() else {
            info!("driver_host: no driver directory configured");
            return Ok(0);
        };
        let context = self.context.clone();
        let dispatcher: Arc<dyn Dispatch> = self.dispatcher.clone();
        let bound = Arc::clone(&self.bound);
        let scan = find_drivers(dir, Arc::new(ManifestLoader), move |driver| {
            queue_bind(&context, &dispatcher, &bound, driver);
        })?;
        let found = scan.join().map_err(|_| {
            error!("driver_host: driver loader thread panicked");
            DaemonError::Status(Status::Internal)
        })??;
        info!("driver_host: {found} drivers discovered");
        Ok(found)
    }

    /// Runs every ready loop handler, returning how many ran.
    pub fn run_once(&self) -> usize {
        self.host_loop.run_until_idle()
    }

    /// Runs the host loop until [`Daemon::shutdown`].
    pub fn run(&self) {
        self.host_loop.run();
    }

    /// Host loop driving the work runner.
    pub fn host_loop(&self) -> &HostLoop {
        &self.host_loop
    }

    /// Work-item runner.
    pub fn context(&self) -> &DriverHostContext {
        &self.context
    }

    /// Dispatcher serving control channels.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// PCI root host, if pools were configured.
    pub fn root_host(&self) -> Option<&PciRootHost> {
        self.root_host.as_ref()
    }

    /// Names of the bound drivers in bind order.
    pub fn bound_drivers(&self) -> Vec<String> {
        self.bound.lock().iter().map(|bound| bound.device.name().to_string()).collect()
    }

    /// Runs `f` against the bound driver called `name`.
    pub fn with_bound<R>(&self, name: &str, f: impl FnOnce(&BoundDriver) -> R) -> Option<R> {
        self.bound.lock().iter().find(|bound| bound.device.name() == name).map(f)
    }

    /// Stops the loop and the dispatcher. Idempotent.
    pub fn shutdown(&self) {
        self.host_loop.shutdown();
        self.dispatcher.shutdown();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn queue_bind(
    context: &DriverHostContext,
    dispatcher: &Arc<dyn Dispatch>,
    bound: &Arc<Mutex<Vec<BoundDriver>>>,
    driver: Driver,
) {
    let flags = DeviceFlags::from_bits_truncate(driver.record().flags) | DeviceFlags::INVISIBLE;
    let device = match Device::new(driver.name(), 0, flags) {
        Ok(device) => device,
        Err(status) => {
            error!("driver_host: cannot create device for {}: {status}", driver.name());
            return;
        }
    };
    let dispatcher = Arc::clone(dispatcher);
    let bound = Arc::clone(bound);
    let work_device = Arc::clone(&device);
    context.push_work_item(&device, move || match bind(work_device, &driver, dispatcher) {
        Ok(driver) => bound.lock().push(driver),
        Err(status) => error!("driver_host: failed to bind {}: {status}", driver.name()),
    });
}

fn bind(device: Arc<Device>, driver: &Driver, dispatcher: Arc<dyn Dispatch>) -> Result<BoundDriver, Status> {
    let (control, host_end) = Channel::create()?;
    let received = Arc::new(AtomicUsize::new(0));
    serve_control(host_end.unowned(), dispatcher, Arc::clone(&received));
    device.make_visible();
    info!(
        "driver_host: bound {} {} from {}",
        driver.name(),
        driver.record().version,
        driver.path().display()
    );
    Ok(BoundDriver {
        device,
        manifest: driver.path().to_path_buf(),
        control,
        _host_end: host_end,
        received,
    })
}

fn serve_control(channel: UnownedChannel, dispatcher: Arc<dyn Dispatch>, received: Arc<AtomicUsize>) {
    let koid = channel.koid();
    let armed = channel.wait_async(dispatcher, move |dispatcher, channel, status| {
        if let Err(status) = status {
            debug!("driver_host: control channel {} done: {status}", channel.koid().raw());
            return;
        }
        loop {
            match channel.read() {
                Ok(message) => {
                    trace!(
                        "driver_host: control message of {} bytes, {} handles",
                        message.bytes().len(),
                        message.handles.len()
                    );
                    received.fetch_add(1, Ordering::AcqRel);
                }
                Err(Status::ShouldWait) => break,
                Err(status) => {
                    debug!("driver_host: control channel {} done: {status}", channel.koid().raw());
                    return;
                }
            }
        }
        serve_control(channel, dispatcher, received);
    });
    if let Err(status) = armed {
        debug!("driver_host: cannot serve control channel {}: {status}", koid.raw());
    }
}
