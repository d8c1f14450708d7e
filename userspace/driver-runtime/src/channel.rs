// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Linked channel endpoints with single-registration async reads
//!
//! Both endpoints of a pair share one lock. Every operation that touches a
//! queue, a peer link or a registration takes that lock exactly once. The
//! dispatcher bookkeeping calls (register, queue, cancel) are made under it;
//! they never run callbacks. Handlers always run with the lock released.
//!
//! Each endpoint owns one reusable [`CallbackRequest`]. `wait_async` parks it
//! on the dispatcher, a message or a peer closure queues it, and it comes back
//! when the dispatcher invokes it (or when it is cancelled). Per endpoint:
//!
//! ```text
//! Idle --wait_async--> Armed --(message | peer closed)--> Queued
//! Queued --dispatcher runs--> InCallback --handler returns--> Idle | Armed
//! Armed | Queued --dispatcher shutdown--> InCallback (Canceled)
//! any --close--> Closed
//! ```
//!
//! A handler may re-arm its own endpoint. The new registration is only queued
//! once the running handler has returned, so at most one callback per
//! endpoint is ever in flight. A dispatcher that has shut down refuses new
//! registrations, so a handler re-arming from its `Canceled` callback gets
//! `BadState` instead of another callback.

use core::ops::Deref;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use log::trace;
use nexus_kobj::Koid;
use parking_lot::Mutex;

use crate::{Arena, ArenaBytes, CallbackRequest, Dispatch, Handle, RequestId, Result, Status};

type ReadHandler = Box<dyn FnOnce(Arc<dyn Dispatch>, UnownedChannel, Result<()>) + Send>;

/// A message taken off a channel. The reader owns everything in it.
#[derive(Debug, Default)]
pub struct Message {
    /// Arena the payload was allocated from.
    pub arena: Option<Arena>,
    /// Payload bytes.
    pub data: Option<ArenaBytes>,
    /// Transferred objects.
    pub handles: Vec<Handle>,
}

impl Message {
    /// Payload bytes, empty if the message carried none.
    pub fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

// The endpoint's request is registered on `dispatcher` for as long as this exists.
struct Registration {
    dispatcher: Arc<dyn Dispatch>,
    handler: ReadHandler,
    id: RequestId,
    queued: bool,
}

struct Endpoint {
    peer_linked: bool,
    closed: bool,
    queue: VecDeque<Message>,
    // Present while the request is owned by the endpoint.
    request: Option<CallbackRequest>,
    registration: Option<Registration>,
    callback_thread: Option<ThreadId>,
    // Completion that arrived while a handler was still running.
    deferred: Option<Result<()>>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            peer_linked: true,
            closed: false,
            queue: VecDeque::new(),
            request: Some(CallbackRequest::new()),
            registration: None,
            callback_thread: None,
            deferred: None,
        }
    }

    fn can_queue(&self) -> bool {
        !self.closed
            && self.callback_thread.is_none()
            && self.registration.as_ref().is_some_and(|registration| !registration.queued)
    }

    fn queue_registered(&mut self, reason: Result<()>) {
        let Some(registration) = self.registration.as_mut() else {
            return;
        };
        // A refusal means shutdown owns the request and cancels it.
        registration.queued = registration.dispatcher.queue_registered_callback(registration.id, reason);
        trace!(
            "channel: {:?} on {} queued={}",
            registration.id,
            registration.dispatcher.name(),
            registration.queued
        );
    }

    fn begin_callback(&mut self, reason: Result<()>) -> Option<(Registration, Result<()>)> {
        let registration = self.registration.take()?;
        self.callback_thread = Some(thread::current().id());
        Some((registration, reason))
    }

    // Runs on the callback thread once the handler has returned.
    fn finish_callback(&mut self) -> Option<(Registration, Result<()>)> {
        self.callback_thread = None;
        if self.closed {
            return None;
        }
        if let Some(reason) = self.deferred.take() {
            return self.begin_callback(reason);
        }
        if self.can_queue() {
            if !self.queue.is_empty() {
                self.queue_registered(Ok(()));
            } else if !self.peer_linked {
                self.queue_registered(Err(Status::PeerClosed));
            }
        }
        None
    }
}

struct ChannelShared {
    koids: [Koid; 2],
    endpoints: Mutex<[Endpoint; 2]>,
}

fn dispatcher_callback(
    shared: &Weak<ChannelShared>,
    side: usize,
    request: CallbackRequest,
    reason: Result<()>,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut next = {
        let mut endpoints = shared.endpoints.lock();
        let this = &mut endpoints[side];
        this.request = Some(request);
        if this.closed {
            return;
        }
        if this.callback_thread.is_some() {
            // Shutdown cancelled a registration made by the running handler.
            this.deferred = Some(reason);
            return;
        }
        this.begin_callback(reason)
    };

    while let Some((registration, reason)) = next {
        let Registration { dispatcher, handler, .. } = registration;
        handler(dispatcher, UnownedChannel { shared: Arc::clone(&shared), side }, reason);
        next = shared.endpoints.lock()[side].finish_callback();
    }
}

/// A borrowed view of an endpoint. It can read, write and re-arm but closing
/// it does not require ownership of the endpoint.
#[derive(Clone)]
pub struct UnownedChannel {
    shared: Arc<ChannelShared>,
    side: usize,
}

impl UnownedChannel {
    /// Object identifier of this endpoint.
    pub fn koid(&self) -> Koid {
        self.shared.koids[self.side]
    }

    /// Object identifier of the linked endpoint.
    pub fn peer_koid(&self) -> Koid {
        self.shared.koids[1 - self.side]
    }

    /// Queues a message on the peer endpoint without blocking.
    ///
    /// `handles` are consumed even when the write fails.
    pub fn write(
        &self,
        arena: Option<&Arena>,
        data: Option<ArenaBytes>,
        handles: Vec<Handle>,
    ) -> Result<()> {
        self.check_write_args(arena, data.as_ref(), &handles)?;
        let message = Message { arena: arena.cloned(), data, handles };
        let peer_side = 1 - self.side;
        let mut endpoints = self.shared.endpoints.lock();
        let this = &endpoints[self.side];
        if this.closed {
            return Err(Status::BadHandle);
        }
        if !this.peer_linked {
            return Err(Status::PeerClosed);
        }
        let peer = &mut endpoints[peer_side];
        peer.queue.push_back(message);
        trace!("channel {}: queued message, depth {}", self.peer_koid().raw(), peer.queue.len());
        if peer.can_queue() {
            peer.queue_registered(Ok(()));
        }
        Ok(())
    }

    fn check_write_args(
        &self,
        arena: Option<&Arena>,
        data: Option<&ArenaBytes>,
        handles: &[Handle],
    ) -> Result<()> {
        let Some(arena) = arena else {
            if data.is_some() || !handles.is_empty() {
                return Err(Status::InvalidArgs);
            }
            return Ok(());
        };
        if data.is_some_and(|data| !arena.contains(data)) {
            return Err(Status::InvalidArgs);
        }
        for handle in handles {
            if let Handle::Channel(channel) = handle {
                if Arc::ptr_eq(&channel.shared, &self.shared) {
                    return Err(Status::NotSupported);
                }
                if channel.has_incomplete_wait_async() {
                    return Err(Status::InvalidArgs);
                }
            }
        }
        Ok(())
    }

    /// Takes the oldest queued message without blocking.
    ///
    /// Messages queued before the peer closed stay readable.
    pub fn read(&self) -> Result<Message> {
        let mut endpoints = self.shared.endpoints.lock();
        let this = &mut endpoints[self.side];
        if this.closed {
            return Err(Status::BadHandle);
        }
        match this.queue.pop_front() {
            Some(message) => Ok(message),
            None if this.peer_linked => Err(Status::ShouldWait),
            None => Err(Status::PeerClosed),
        }
    }

    /// Registers the single read notification for this endpoint.
    ///
    /// `handler` runs once on `dispatcher` when a message is available or the
    /// peer has closed, or with `Canceled` if the dispatcher shuts down first.
    /// Fails with `BadState` while another registration is armed, while a
    /// handler runs on a different thread, or once `dispatcher` has shut down.
    pub fn wait_async<F>(&self, dispatcher: Arc<dyn Dispatch>, handler: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn Dispatch>, UnownedChannel, Result<()>) + Send + 'static,
    {
        let mut endpoints = self.shared.endpoints.lock();
        let this = &mut endpoints[self.side];
        if this.closed {
            return Err(Status::BadHandle);
        }
        if this.queue.is_empty() && !this.peer_linked {
            return Err(Status::PeerClosed);
        }
        if this.registration.is_some() {
            return Err(Status::BadState);
        }
        if this.callback_thread.is_some_and(|id| id != thread::current().id()) {
            return Err(Status::BadState);
        }
        // Absent only while a cancellation is on its way back to us.
        let Some(mut request) = this.request.take() else {
            return Err(Status::BadState);
        };
        let id = request.id();
        let weak = Arc::downgrade(&self.shared);
        let side = self.side;
        request.set_callback(
            Box::new(move |request, reason| dispatcher_callback(&weak, side, request, reason)),
            Ok(()),
        );
        if let Err(request) = dispatcher.register_callback(request) {
            this.request = Some(request);
            trace!("channel {}: {} refused registration", self.koid().raw(), dispatcher.name());
            return Err(Status::BadState);
        }
        this.registration = Some(Registration { dispatcher, handler: Box::new(handler), id, queued: false });
        if this.can_queue() && !this.queue.is_empty() {
            this.queue_registered(Ok(()));
        }
        Ok(())
    }

    /// Returns `true` while a registration is armed or queued.
    pub fn has_incomplete_wait_async(&self) -> bool {
        self.shared.endpoints.lock()[self.side].registration.is_some()
    }

    /// Number of messages waiting to be read on this endpoint.
    pub fn queued_messages(&self) -> usize {
        self.shared.endpoints.lock()[self.side].queue.len()
    }

    /// Closes this endpoint. Idempotent.
    ///
    /// Queued messages are dropped, this endpoint's registration is withdrawn
    /// without running, and an armed peer is woken with `PeerClosed`.
    pub fn close(&self) {
        let peer_side = 1 - self.side;
        let (dropped, registration) = {
            let mut endpoints = self.shared.endpoints.lock();
            let this = &mut endpoints[self.side];
            if this.closed {
                return;
            }
            this.closed = true;
            this.deferred = None;
            let was_linked = core::mem::replace(&mut this.peer_linked, false);
            let dropped: Vec<Message> = this.queue.drain(..).collect();
            let registration = this.registration.take();
            if let Some(registration) = &registration {
                // A miss means the request is already running; the callback sees `closed`.
                if let Some(request) = registration.dispatcher.cancel_callback(registration.id) {
                    trace!("channel {}: withdrew {:?}", self.koid().raw(), registration.id);
                    this.request = Some(request);
                }
            }

            if was_linked {
                let peer = &mut endpoints[peer_side];
                peer.peer_linked = false;
                if peer.can_queue() && peer.queue.is_empty() {
                    peer.queue_registered(Err(Status::PeerClosed));
                }
            }
            (dropped, registration)
        };
        drop(registration);
        drop(dropped);
    }
}

impl core::fmt::Debug for UnownedChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnownedChannel").field("koid", &self.koid()).finish()
    }
}

/// An owned channel endpoint. Dropping it closes the endpoint.
pub struct Channel {
    unowned: UnownedChannel,
}

impl Channel {
    /// Creates a linked pair of endpoints.
    pub fn create() -> Result<(Channel, Channel)> {
        let shared = Arc::new(ChannelShared {
            koids: [Koid::next(), Koid::next()],
            endpoints: Mutex::new([Endpoint::new(), Endpoint::new()]),
        });
        let first = Channel { unowned: UnownedChannel { shared: Arc::clone(&shared), side: 0 } };
        let second = Channel { unowned: UnownedChannel { shared, side: 1 } };
        Ok((first, second))
    }

    /// Returns a borrowed view that can be moved into handlers.
    pub fn unowned(&self) -> UnownedChannel {
        self.unowned.clone()
    }
}

impl Deref for Channel {
    type Target = UnownedChannel;

    fn deref(&self) -> &UnownedChannel {
        &self.unowned
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.unowned.close();
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").field("koid", &self.koid()).finish()
    }
}
