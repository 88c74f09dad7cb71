// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end listener scenarios over the real TCP sockaddr transport:
//! connection requests arrive on the accept thread, accept callbacks run
//! on the worker thread.

use amlink::transport::sockaddr::tcp_resource;
use amlink::{listen, Error, ListenerParams, Worker};
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn tcp_worker() -> Worker {
    let worker = Worker::new();
    worker.register_resource(tcp_resource());
    worker
}

/// Wait until `n` deferred items are queued on the worker.
fn wait_for_pending(worker: &Worker, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.shared().pending_items() < n && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(worker.shared().pending_items(), n);
}

#[test]
fn accept_callback_runs_once_on_worker() {
    let worker = tcp_worker();

    struct Ctx {
        hits: AtomicUsize,
    }
    let ctx = Arc::new(Ctx {
        hits: AtomicUsize::new(0),
    });

    let cb_ctx = Arc::clone(&ctx);
    let params = ListenerParams::new()
        .with_sockaddr("127.0.0.1:0".parse().unwrap())
        .with_accept_handler(Arc::new(move |ep| {
            assert!(ep.is_none());
            cb_ctx.hits.fetch_add(1, Ordering::SeqCst);
        }));

    let listener = listen(&worker, &params).expect("listen");
    let addr = listener.local_addr();
    assert_ne!(addr.port(), 0);

    let _conn = TcpStream::connect(addr).expect("connect");
    wait_for_pending(&worker, 1);

    // The callback never fires before the worker progresses.
    assert_eq!(ctx.hits.load(Ordering::SeqCst), 0);
    assert_eq!(worker.progress(), 1);
    assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);

    // No spurious second invocation.
    worker.progress_all();
    assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);

    listener.destroy();
}

#[test]
fn requests_are_delivered_in_connection_order() {
    let worker = tcp_worker();

    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let params = ListenerParams::new()
        .with_sockaddr("127.0.0.1:0".parse().unwrap())
        .with_accept_handler(Arc::new(move |_ep| {
            let mut order = o.lock();
            let next = order.len();
            order.push(next);
        }));

    let listener = listen(&worker, &params).expect("listen");
    let addr = listener.local_addr();

    // Sequential connects keep the kernel accept queue ordered.
    let mut conns = Vec::new();
    for _ in 0..4 {
        conns.push(TcpStream::connect(addr).expect("connect"));
    }
    wait_for_pending(&worker, 4);

    assert_eq!(worker.progress(), 4);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);

    listener.destroy();
}

#[test]
fn unreachable_sockaddr_is_invalid_addr() {
    let worker = tcp_worker();

    // TEST-NET-1 is never assigned to a local interface.
    let params = ListenerParams::new().with_sockaddr("192.0.2.1:9".parse().unwrap());
    let err = listen(&worker, &params).unwrap_err();
    assert!(matches!(err, Error::InvalidAddr(_)));
}

#[test]
fn worker_without_resources_is_invalid_addr() {
    let worker = Worker::new();
    let params = ListenerParams::new().with_sockaddr("127.0.0.1:0".parse().unwrap());
    let err = listen(&worker, &params).unwrap_err();
    assert!(matches!(err, Error::InvalidAddr(_)));
}

#[test]
fn destroy_before_progress_drops_pending_accept() {
    let worker = tcp_worker();

    let invoked = Arc::new(AtomicUsize::new(0));
    let i = Arc::clone(&invoked);
    let params = ListenerParams::new()
        .with_sockaddr("127.0.0.1:0".parse().unwrap())
        .with_accept_handler(Arc::new(move |_ep| {
            i.fetch_add(1, Ordering::SeqCst);
        }));

    let listener = listen(&worker, &params).expect("listen");
    let addr = listener.local_addr();

    let _conn = TcpStream::connect(addr).expect("connect");
    wait_for_pending(&worker, 1);

    // Destroy is synchronous; the queued item must drop, not dispatch.
    listener.destroy();
    assert_eq!(worker.progress(), 1);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn sequential_listeners_share_a_worker() {
    let worker = tcp_worker();

    for _ in 0..3 {
        let params = ListenerParams::new().with_sockaddr("127.0.0.1:0".parse().unwrap());
        let listener = listen(&worker, &params).expect("listen");
        let addr = listener.local_addr();
        let _conn = TcpStream::connect(addr).expect("connect");
        listener.destroy();
    }
    // Fire-and-forget listeners never defer items.
    assert_eq!(worker.progress(), 0);
}
