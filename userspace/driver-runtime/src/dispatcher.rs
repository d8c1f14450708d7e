// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Callback dispatchers
//!
//! Channels only depend on the [`Dispatch`] trait. A request is first
//! registered (parked on the dispatcher without running), then queued with a
//! reason once its owner has something to report, or withdrawn before it
//! starts. [`Dispatcher`] is the thread-pool implementation used by driver
//! hosts.
//!
//! Workers pop at most [`BATCH_SIZE`] requests per wake. A synchronized
//! dispatcher never runs two callbacks at the same time; an unsynchronized one
//! lets every worker run batches in parallel.
//!
//! [`Dispatcher::shutdown`] invokes every registered or queued request once
//! with `Err(Status::Canceled)` on the thread that called it, so owners get
//! their slots back. Requests offered afterwards are handed back untouched
//! and never run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::{CallbackRequest, RequestId, Result, Status};

/// Maximum callbacks a worker takes from the queue per wake.
pub const BATCH_SIZE: usize = 10;

/// Scheduling seam consumed by channels.
pub trait Dispatch: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Parks `request` until it is queued, cancelled or the dispatcher shuts
    /// down. Hands the request back if the dispatcher no longer accepts work.
    fn register_callback(&self, request: CallbackRequest) -> core::result::Result<(), CallbackRequest>;

    /// Moves a registered request onto the run queue; its callback observes
    /// `reason`. Returns `false` if the request is not registered, including
    /// when shutdown has already claimed it.
    fn queue_registered_callback(&self, id: RequestId, reason: Result<()>) -> bool;

    /// Withdraws a registered or queued request that has not started running.
    fn cancel_callback(&self, id: RequestId) -> Option<CallbackRequest>;

    /// Registers `request` and queues it with its current reason. Hands the
    /// request back if the dispatcher no longer accepts work.
    fn queue_callback(&self, request: CallbackRequest) -> core::result::Result<(), CallbackRequest> {
        let id = request.id();
        let reason = request.reason();
        self.register_callback(request)?;
        self.queue_registered_callback(id, reason);
        Ok(())
    }
}

/// Construction parameters for [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Diagnostic name, also used for worker thread names.
    pub name: String,
    /// Number of worker threads.
    pub threads: usize,
    /// Allow callbacks to run concurrently.
    pub unsynchronized: bool,
}

impl DispatcherOptions {
    /// Synchronized dispatcher with a single worker.
    pub fn synchronized(name: impl Into<String>) -> Self {
        Self { name: name.into(), threads: 1, unsynchronized: false }
    }

    /// Unsynchronized dispatcher with `threads` workers.
    pub fn unsynchronized(name: impl Into<String>, threads: usize) -> Self {
        Self { name: name.into(), threads, unsynchronized: true }
    }
}

/// Thread-pool dispatcher.
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    name: String,
    unsynchronized: bool,
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

struct QueueState {
    queue: VecDeque<CallbackRequest>,
    registered: Vec<CallbackRequest>,
    running: bool,
    // Set while a synchronized dispatcher is running a batch.
    dispatching: bool,
    active: usize,
    worker_ids: Vec<ThreadId>,
}

impl Dispatcher {
    /// Starts a dispatcher and its workers.
    pub fn create(options: DispatcherOptions) -> Result<Arc<Dispatcher>> {
        if options.threads == 0 {
            return Err(Status::InvalidArgs);
        }
        if !options.unsynchronized && options.threads > 1 {
            debug!(
                "dispatcher {}: synchronized with {} workers, only one runs at a time",
                options.name, options.threads
            );
        }
        let inner = Arc::new(Inner {
            name: options.name.clone(),
            unsynchronized: options.unsynchronized,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                registered: Vec::new(),
                running: true,
                dispatching: false,
                active: 0,
                worker_ids: Vec::new(),
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(options.threads);
        for index in 0..options.threads {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", options.name, index))
                .spawn(move || worker_loop(worker_inner));
            match spawned {
                Ok(handle) => {
                    inner.state.lock().worker_ids.push(handle.thread().id());
                    workers.push(handle);
                }
                Err(err) => {
                    warn!("dispatcher {}: failed to spawn worker: {err}", options.name);
                    let dispatcher = Dispatcher { inner, workers: Mutex::new(workers) };
                    dispatcher.shutdown();
                    return Err(Status::NoResources);
                }
            }
        }
        debug!(
            "dispatcher {}: started {} worker(s), unsynchronized={}",
            options.name, options.threads, options.unsynchronized
        );
        Ok(Arc::new(Dispatcher { inner, workers: Mutex::new(workers) }))
    }

    /// Returns `true` if callbacks may run concurrently.
    pub fn is_unsynchronized(&self) -> bool {
        self.inner.unsynchronized
    }

    /// Number of requests waiting to run.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of registered requests not yet queued.
    pub fn registered_callbacks(&self) -> usize {
        self.inner.state.lock().registered.len()
    }

    /// Blocks until no request is queued or running.
    ///
    /// Must not be called from one of this dispatcher's workers.
    pub fn wait_until_idle(&self) {
        let mut state = self.inner.state.lock();
        while !(state.queue.is_empty() && state.active == 0) {
            self.inner.idle.wait(&mut state);
        }
    }

    /// Stops the workers and cancels every registered or queued request on the
    /// calling thread. Idempotent.
    pub fn shutdown(&self) {
        let (cancelled, current_is_worker) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let current = thread::current().id();
            let mut cancelled: Vec<CallbackRequest> = state.queue.drain(..).collect();
            cancelled.append(&mut state.registered);
            (cancelled, state.worker_ids.contains(&current))
        };
        self.inner.work.notify_all();
        debug!("dispatcher {}: shutting down, cancelling {} request(s)", self.inner.name, cancelled.len());
        for mut request in cancelled {
            request.set_reason(Err(Status::Canceled));
            request.call();
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if current_is_worker {
            // Joining from a worker would wait on ourselves; the workers exit on their own.
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("dispatcher {}: worker panicked", self.inner.name);
            }
        }
        self.inner.idle.notify_all();
    }
}

impl Dispatch for Dispatcher {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn register_callback(&self, request: CallbackRequest) -> core::result::Result<(), CallbackRequest> {
        let mut state = self.inner.state.lock();
        if !state.running {
            debug!("dispatcher {}: refusing {:?} after shutdown", self.inner.name, request.id());
            return Err(request);
        }
        trace!("dispatcher {}: registered {:?}", self.inner.name, request.id());
        state.registered.push(request);
        Ok(())
    }

    fn queue_registered_callback(&self, id: RequestId, reason: Result<()>) -> bool {
        let mut state = self.inner.state.lock();
        if !state.running {
            return false;
        }
        let Some(index) = state.registered.iter().position(|request| request.id() == id) else {
            return false;
        };
        let mut request = state.registered.swap_remove(index);
        request.set_reason(reason);
        trace!("dispatcher {}: queued {id:?}", self.inner.name);
        state.queue.push_back(request);
        drop(state);
        self.inner.work.notify_one();
        true
    }

    fn cancel_callback(&self, id: RequestId) -> Option<CallbackRequest> {
        let mut state = self.inner.state.lock();
        if let Some(index) = state.registered.iter().position(|request| request.id() == id) {
            return Some(state.registered.swap_remove(index));
        }
        let index = state.queue.iter().position(|request| request.id() == id)?;
        let request = state.queue.remove(index);
        if state.queue.is_empty() && state.active == 0 {
            self.inner.idle.notify_all();
        }
        request
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let batch: Vec<CallbackRequest> = {
            let mut state = inner.state.lock();
            loop {
                let blocked = !inner.unsynchronized && state.dispatching;
                if !state.queue.is_empty() && !blocked {
                    break;
                }
                if !state.running && state.queue.is_empty() {
                    return;
                }
                inner.work.wait(&mut state);
            }
            let count = state.queue.len().min(BATCH_SIZE);
            state.active += 1;
            if !inner.unsynchronized {
                state.dispatching = true;
            }
            let batch = state.queue.drain(..count).collect();
            // Let another worker pick up the remainder in parallel.
            if inner.unsynchronized && !state.queue.is_empty() {
                inner.work.notify_one();
            }
            batch
        };

        for request in batch {
            request.call();
        }

        let mut state = inner.state.lock();
        state.active -= 1;
        if !inner.unsynchronized {
            state.dispatching = false;
            if !state.queue.is_empty() {
                inner.work.notify_one();
            }
        }
        if state.queue.is_empty() && state.active == 0 {
            inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn request_sending(tx: mpsc::Sender<(usize, Result<()>)>, tag: usize) -> CallbackRequest {
        let mut request = CallbackRequest::new();
        request.set_callback(Box::new(move |_slot, reason| tx.send((tag, reason)).unwrap()), Ok(()));
        request
    }

    /// Queues a callback that blocks its worker until the returned sender fires.
    fn occupy_worker(dispatcher: &Dispatcher) -> mpsc::Sender<()> {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let mut blocker = CallbackRequest::new();
        blocker.set_callback(
            Box::new(move |_, _| {
                started_tx.send(()).unwrap();
                gate_rx.recv().unwrap();
            }),
            Ok(()),
        );
        dispatcher.queue_callback(blocker).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).expect("blocker started");
        gate_tx
    }

    #[test]
    fn rejects_zero_threads() {
        let options = DispatcherOptions { name: "none".into(), threads: 0, unsynchronized: true };
        assert_eq!(Dispatcher::create(options).err(), Some(Status::InvalidArgs));
    }

    #[test]
    fn synchronized_dispatcher_runs_in_queue_order() {
        let dispatcher = Dispatcher::create(DispatcherOptions::synchronized("sync")).unwrap();
        assert!(!dispatcher.is_unsynchronized());
        let (tx, rx) = mpsc::channel();
        for tag in 0..25 {
            dispatcher.queue_callback(request_sending(tx.clone(), tag)).unwrap();
        }
        dispatcher.wait_until_idle();
        let order: Vec<usize> = rx.try_iter().map(|(tag, _)| tag).collect();
        assert_eq!(order, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn synchronized_dispatcher_never_overlaps_callbacks() {
        let mut options = DispatcherOptions::synchronized("serial");
        options.threads = 4;
        let dispatcher = Dispatcher::create(options).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        for _ in 0..40 {
            let running = Arc::clone(&running);
            let overlaps = Arc::clone(&overlaps);
            let mut request = CallbackRequest::new();
            request.set_callback(
                Box::new(move |_, _| {
                    if running.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(200));
                    running.fetch_sub(1, Ordering::SeqCst);
                }),
                Ok(()),
            );
            dispatcher.queue_callback(request).unwrap();
        }
        dispatcher.wait_until_idle();
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_request_is_returned_and_never_runs() {
        let dispatcher = Dispatcher::create(DispatcherOptions::synchronized("cancel")).unwrap();
        let gate_tx = occupy_worker(&dispatcher);

        let (tx, rx) = mpsc::channel();
        let request = request_sending(tx.clone(), 1);
        let id = request.id();
        dispatcher.queue_callback(request).unwrap();

        let returned = dispatcher.cancel_callback(id).expect("still queued");
        assert!(returned.is_pending());
        assert!(dispatcher.cancel_callback(id).is_none());

        let parked = request_sending(tx, 2);
        let parked_id = parked.id();
        dispatcher.register_callback(parked).unwrap();
        assert_eq!(dispatcher.registered_callbacks(), 1);
        assert!(dispatcher.cancel_callback(parked_id).is_some());
        assert!(!dispatcher.queue_registered_callback(parked_id, Ok(())));

        gate_tx.send(()).unwrap();
        dispatcher.wait_until_idle();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registered_request_runs_only_once_queued() {
        let dispatcher = Dispatcher::create(DispatcherOptions::synchronized("park")).unwrap();
        let (tx, rx) = mpsc::channel();
        let request = request_sending(tx, 7);
        let id = request.id();
        dispatcher.register_callback(request).unwrap();
        dispatcher.wait_until_idle();
        assert!(rx.try_recv().is_err());

        assert!(dispatcher.queue_registered_callback(id, Err(Status::PeerClosed)));
        assert!(!dispatcher.queue_registered_callback(id, Ok(())), "already queued");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (7, Err(Status::PeerClosed)));
        assert_eq!(dispatcher.registered_callbacks(), 0);
    }

    #[test]
    fn shutdown_cancels_on_calling_thread_and_refuses_late_requests() {
        let dispatcher = Dispatcher::create(DispatcherOptions::synchronized("down")).unwrap();
        let gate_tx = occupy_worker(&dispatcher);

        let (tx, rx) = mpsc::channel();
        let report = |tag: usize| {
            let tx = tx.clone();
            let mut request = CallbackRequest::new();
            request.set_callback(
                Box::new(move |_slot, reason| tx.send((tag, reason, thread::current().id())).unwrap()),
                Ok(()),
            );
            request
        };
        dispatcher.queue_callback(report(1)).unwrap();
        let parked = report(2);
        let parked_id = parked.id();
        dispatcher.register_callback(parked).unwrap();

        // Release the blocker only after shutdown has drained the queue.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate_tx.send(()).unwrap();
        });
        dispatcher.shutdown();
        releaser.join().unwrap();

        let me = thread::current().id();
        let mut results: Vec<_> = rx.try_iter().collect();
        results.sort_by_key(|(tag, _, _)| *tag);
        assert_eq!(results, vec![(1, Err(Status::Canceled), me), (2, Err(Status::Canceled), me)]);

        let late = dispatcher.queue_callback(report(3)).unwrap_err();
        assert!(late.is_pending(), "handed back without running");
        assert!(dispatcher.register_callback(report(4)).is_err());
        assert!(!dispatcher.queue_registered_callback(parked_id, Ok(())));
        assert!(rx.try_recv().is_err());
        drop(late);
    }

    #[test]
    fn unsynchronized_dispatcher_runs_everything() {
        let dispatcher = Dispatcher::create(DispatcherOptions::unsynchronized("pool", 3)).unwrap();
        assert!(dispatcher.is_unsynchronized());
        let (tx, rx) = mpsc::channel();
        for tag in 0..100 {
            dispatcher.queue_callback(request_sending(tx.clone(), tag)).unwrap();
        }
        dispatcher.wait_until_idle();
        let mut seen: Vec<usize> = rx.try_iter().map(|(tag, _)| tag).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(dispatcher.pending_callbacks(), 0);
    }
}
