// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-crate driver framework flows
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 end-to-end tests
//!
//! TEST_SCOPE:
//!   - Readable notification, read and drain on a real dispatcher
//!   - Channel handlers deferring work to the driver host runner
//!   - Root host window tokens carried inside channel messages
//!
//! TEST_SCENARIOS:
//!   - readable_then_drained()
//!   - channel_requests_become_work_items()
//!   - window_token_travels_and_releases_on_read_side()
//!   - closing_reader_with_queued_token_reclaims_window()
//!
//! DEPENDENCIES:
//!   - nexus-driver-e2e harness: HostFixture, send, eventually
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use std::sync::mpsc;
use std::sync::Arc;

use nexus_driver_e2e::{dispatcher, eventually, mmio32_root_host, send, HostFixture, WAIT};
use nexus_driver_host::{Device, DeviceFlags, DriverHostContext};
use nexus_driver_runtime::{Channel, Dispatch, Handle, Status, UnownedChannel};
use nexus_kobj::Waitable;
use nexus_pci_root::{AllocationType, RegionSpan};

#[test]
fn readable_then_drained() {
    let dispatcher = dispatcher("e2e-readable");
    let (a, b) = Channel::create().unwrap();
    send(&a, &[0x01, 0x02], Vec::new()).unwrap();

    let (tx, rx) = mpsc::channel();
    b.wait_async(dispatcher.clone(), move |_, channel, status| {
        let first = channel.read().map(|message| (message.bytes().to_vec(), message.handles.len()));
        let second = channel.read().map(|_| ());
        tx.send((status, first, second)).unwrap();
    })
    .unwrap();

    let (status, first, second) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(status, Ok(()));
    assert_eq!(first, Ok((vec![0x01, 0x02], 0)));
    assert_eq!(second, Err(Status::ShouldWait));
    dispatcher.wait_until_idle();
    assert!(rx.try_recv().is_err(), "callback fired once");
}

fn serve_requests(
    channel: UnownedChannel,
    dispatcher: Arc<dyn Dispatch>,
    context: DriverHostContext,
    device: Arc<Device>,
    done: mpsc::Sender<u8>,
) -> Result<(), Status> {
    channel.wait_async(dispatcher, move |dispatcher, channel, status| {
        if status.is_err() {
            return;
        }
        while let Ok(message) = channel.read() {
            let request = message.bytes()[0];
            let done = done.clone();
            context.push_work_item(&device, move || done.send(request).unwrap());
        }
        // Refused once the dispatcher has shut down.
        let _ = serve_requests(channel, dispatcher, context, device, done);
    })
}

#[test]
fn channel_requests_become_work_items() {
    let fixture = HostFixture::start(2);
    let dispatcher = dispatcher("e2e-requests");
    let device = Device::new("e2e-dev", 0x70, DeviceFlags::empty()).unwrap();
    let (client, server) = Channel::create().unwrap();
    let (done, completed) = mpsc::channel();
    serve_requests(server.unowned(), dispatcher.clone(), fixture.context.clone(), device, done).unwrap();

    for request in 0..20u8 {
        send(&client, &[request], Vec::new()).unwrap();
    }
    let order: Vec<u8> = (0..20).map(|_| completed.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
    dispatcher.shutdown();
}

#[test]
fn window_token_travels_and_releases_on_read_side() {
    let root_host = mmio32_root_host(0x8000_0000, 0x2000);
    let (window, token) = root_host.allocate_mmio32_window(0, 0x2000).unwrap();
    let token_koid = token.koid();

    let (driver_end, bus_end) = Channel::create().unwrap();
    send(&driver_end, b"window", vec![Handle::from(token)]).unwrap();

    let mut message = bus_end.read().unwrap();
    assert_eq!(message.bytes(), b"window");
    let received = message.handles.pop().and_then(Handle::into_event_pair).unwrap();
    assert_eq!(received.koid(), token_koid);
    assert!(root_host.available_regions(AllocationType::Mmio32).is_empty());

    drop(received);
    root_host.wait_for_worker_ack().unwrap();
    assert_eq!(
        root_host.available_regions(AllocationType::Mmio32),
        vec![RegionSpan { base: window.base(), size: window.size() }]
    );
}

#[test]
fn closing_reader_with_queued_token_reclaims_window() {
    let root_host = mmio32_root_host(0x8000_0000, 0x1000);
    let (_window, token) = root_host.allocate_mmio32_window(0, 0x1000).unwrap();
    let (driver_end, bus_end) = Channel::create().unwrap();
    send(&driver_end, &[], vec![token.into()]).unwrap();
    assert_eq!(bus_end.queued_messages(), 1);

    drop(bus_end);
    assert!(eventually(|| root_host.allocation_count() == Ok(0)));
    assert!(root_host.allocate_mmio32_window(0, 0x1000).is_ok());
    assert_eq!(send(&driver_end, b"late", Vec::new()), Err(Status::PeerClosed));
}
