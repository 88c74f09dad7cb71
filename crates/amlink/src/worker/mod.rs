// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative worker progress context.
//!
//! A [`Worker`] is single-threaded: it owns the transport resource table
//! and the drainable interfaces, and its `progress()` loop is the only
//! place user callbacks run. Other threads interact with it exclusively
//! through [`WorkerShared::progress_register_safe`], which enqueues a
//! one-shot progress item on a lock-free channel; the item executes on the
//! next `progress()` call, in registration order, exactly once.
//!
//! ```text
//! transport async thread            worker progress thread
//!         |                                  |
//!         | progress_register_safe(item)     |
//!         +------------[ MPSC ]------------> | progress():
//!                                            |   run deferred items (FIFO)
//!                                            |   drain registered ifaces
//! ```
//!
//! The worker critical section ([`Worker::critical_section`]) brackets
//! listener mutations: while held, deferred items are not dispatched, so
//! registration state never changes under a running callback.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::transport::{Progressable, TlResource};

/// Identifier of a registered progress item.
///
/// One-shot items unregister themselves after running; the id is returned
/// for diagnostics and log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressId(u64);

/// A deferred one-shot progress item.
struct DeferredItem {
    id: ProgressId,
    run: Box<dyn FnOnce() + Send>,
}

/// Thread-safe half of a worker.
///
/// Cloned (via `Arc`) into transport callbacks that run on async threads.
pub struct WorkerShared {
    /// Critical section gate; also blocks deferred dispatch while held
    gate: Mutex<()>,
    tx: Sender<DeferredItem>,
    rx: Receiver<DeferredItem>,
    next_prog_id: AtomicU64,
}

impl WorkerShared {
    fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            gate: Mutex::new(()),
            tx,
            rx,
            next_prog_id: AtomicU64::new(0),
        }
    }

    /// Register a one-shot progress item from any thread.
    ///
    /// The item runs on the worker thread during a later `progress()`
    /// call, after every item registered before it. One-shot semantics
    /// (run exactly once, then unregister) are carried by the `FnOnce`
    /// itself.
    pub fn progress_register_safe(&self, run: impl FnOnce() + Send + 'static) -> ProgressId {
        let id = ProgressId(self.next_prog_id.fetch_add(1, Ordering::Relaxed));
        // The receiver lives in the same struct, so the channel cannot be
        // disconnected while `self` is alive.
        self.tx
            .send(DeferredItem {
                id,
                run: Box::new(run),
            })
            .expect("worker progress queue disconnected");
        id
    }

    /// Number of deferred items currently queued
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.rx.len()
    }
}

/// Single-threaded cooperative progress context.
///
/// Owns transport resources (in registration order) and drainable
/// interfaces. Not `Send`: the worker stays on its progress thread, and
/// only [`WorkerShared`] crosses threads.
pub struct Worker {
    shared: Arc<WorkerShared>,
    resources: RefCell<Vec<TlResource>>,
    ifaces: RefCell<Vec<Arc<Mutex<dyn Progressable>>>>,
}

impl Worker {
    /// Create a worker with an empty resource table
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WorkerShared::new()),
            resources: RefCell::new(Vec::new()),
            ifaces: RefCell::new(Vec::new()),
        }
    }

    /// The thread-safe half, for transport callbacks
    #[must_use]
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Append a transport resource. Resources are consulted in
    /// registration order by `listen`.
    pub fn register_resource(&self, resource: TlResource) {
        let _cs = self.critical_section();
        log::debug!("[WORKER] registered transport resource '{}'", resource.name);
        self.resources.borrow_mut().push(resource);
    }

    /// Snapshot of the resource table in registration order
    pub(crate) fn resources(&self) -> Vec<TlResource> {
        self.resources.borrow().clone()
    }

    /// Register a drainable interface with the progress loop
    pub fn add_iface(&self, iface: Arc<Mutex<dyn Progressable>>) {
        self.ifaces.borrow_mut().push(iface);
    }

    /// Enter the worker critical section.
    ///
    /// While the guard lives, deferred items are not dispatched and the
    /// resource table does not change; listener setup and teardown run
    /// under it.
    #[must_use]
    pub fn critical_section(&self) -> MutexGuard<'_, ()> {
        self.shared.gate.lock()
    }

    /// Run one progress pass: dispatch all queued deferred items, then
    /// drain each registered interface once. Returns the amount of work
    /// done.
    pub fn progress(&self) -> usize {
        let mut count = 0;

        {
            let _cs = self.shared.gate.lock();
            while let Ok(item) = self.shared.rx.try_recv() {
                log::trace!("[WORKER] running deferred item {:?}", item.id);
                (item.run)();
                count += 1;
            }
        }

        for iface in self.ifaces.borrow().iter() {
            count += iface.lock().progress();
        }

        count
    }

    /// Progress until a pass does no work; returns total work done.
    pub fn progress_all(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.progress();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_progress_empty_is_zero() {
        let worker = Worker::new();
        assert_eq!(worker.progress(), 0);
    }

    #[test]
    fn test_deferred_item_runs_exactly_once() {
        let worker = Worker::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        worker.shared().progress_register_safe(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(worker.progress(), 1);
        assert_eq!(worker.progress(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_items_run_in_registration_order() {
        let worker = Worker::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let o = Arc::clone(&order);
            worker.shared().progress_register_safe(move || {
                o.lock().push(i);
            });
        }

        assert_eq!(worker.progress(), 10);
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_register_from_other_thread() {
        let worker = Worker::new();
        let shared = Arc::clone(worker.shared());
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        let handle = thread::spawn(move || {
            for _ in 0..100 {
                let r = Arc::clone(&r);
                shared.progress_register_safe(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        handle.join().unwrap();

        assert_eq!(worker.shared().pending_items(), 100);
        assert_eq!(worker.progress_all(), 100);
        assert_eq!(runs.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_add_iface_drained_by_progress() {
        struct OneShotWork(usize);
        impl Progressable for OneShotWork {
            fn progress(&mut self) -> usize {
                let n = self.0;
                self.0 = 0;
                n
            }
        }

        let worker = Worker::new();
        worker.add_iface(Arc::new(Mutex::new(OneShotWork(3))));
        assert_eq!(worker.progress(), 3);
        assert_eq!(worker.progress(), 0);
    }

    #[test]
    fn test_progress_ids_are_unique() {
        let worker = Worker::new();
        let a = worker.shared().progress_register_safe(|| {});
        let b = worker.shared().progress_register_safe(|| {});
        assert_ne!(a, b);
        worker.progress_all();
    }
}
