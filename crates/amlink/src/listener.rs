// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sockaddr connection listener.
//!
//! [`listen`] walks the worker's transport resources in registration order
//! and opens a server-mode interface on the first one whose memory domain
//! can bind the requested sockaddr. Inbound connection requests arrive on
//! the transport's async thread; the listener defers the user accept
//! callback onto the worker progress queue as a one-shot item, so user
//! code only ever runs on the worker thread.
//!
//! ```text
//! transport async thread          worker progress thread
//!   conn_request_cb                 worker.progress()
//!     alloc accept record             run one-shot item
//!     register one-shot item  --->      listener.cb(ep)
//!     return ok                         free record
//! ```
//!
//! Teardown: [`Listener::destroy`] flips the record's closed flag before
//! tearing down the interface, so an accept item that is already queued
//! drops cleanly instead of invoking the callback of a dead listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{
    CbFlags, ConnRequest, ConnRequestCallback, ServerIface, ServerIfaceParams, SockaddrAccess,
};
use crate::worker::{Worker, WorkerShared};

/// Field-mask bit: `sockaddr` is present (required)
pub const LISTENER_PARAM_FIELD_SOCKADDR: u64 = 1 << 0;

/// Field-mask bit: `accept_handler` is present (optional)
pub const LISTENER_PARAM_FIELD_ACCEPT_HANDLER: u64 = 1 << 1;

/// Handle to an endpoint being established.
///
/// Connection wire-up is performed by a layer above this crate; the
/// listener only forwards the handle it is given, which at request time is
/// not yet established.
#[derive(Debug)]
pub struct Endpoint {
    _opaque: (),
}

/// User accept callback, invoked on the worker thread once per inbound
/// connection request. The user context travels in the closure capture.
pub type AcceptCallback = Arc<dyn Fn(Option<Endpoint>) + Send + Sync>;

/// Optional accept handler of [`ListenerParams`].
#[derive(Clone, Default)]
pub struct AcceptHandler {
    /// The callback; must be present when the handler field bit is set
    pub cb: Option<AcceptCallback>,
}

/// Parameters for [`listen`].
///
/// `field_mask` declares which fields the caller filled in; the sockaddr
/// field is required, the accept handler optional.
#[derive(Clone, Default)]
pub struct ListenerParams {
    /// Bitwise OR of `LISTENER_PARAM_FIELD_*`
    pub field_mask: u64,
    /// Address to listen on
    pub sockaddr: Option<SocketAddr>,
    /// User accept handler
    pub accept_handler: AcceptHandler,
}

impl ListenerParams {
    /// Empty parameter set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen sockaddr and its field bit
    #[must_use]
    pub fn with_sockaddr(mut self, sockaddr: SocketAddr) -> Self {
        self.field_mask |= LISTENER_PARAM_FIELD_SOCKADDR;
        self.sockaddr = Some(sockaddr);
        self
    }

    /// Set the accept callback and its field bit
    #[must_use]
    pub fn with_accept_handler(mut self, cb: AcceptCallback) -> Self {
        self.field_mask |= LISTENER_PARAM_FIELD_ACCEPT_HANDLER;
        self.accept_handler.cb = Some(cb);
        self
    }
}

/// Listener record shared with in-flight accept items.
struct ListenerShared {
    /// The sockaddr the listener was asked to bind
    sockaddr: SocketAddr,
    /// Set once at creation, read-only thereafter
    cb: Option<AcceptCallback>,
    /// Raised by destroy; queued accept items check it before dispatch
    closed: AtomicBool,
}

/// Transient envelope carrying one inbound request to the worker thread.
///
/// Created in the connection-request callback, consumed exactly once by
/// the one-shot progress item, then freed with it.
struct AcceptRecord {
    listener: Arc<ListenerShared>,
    /// Established later by connection wire-up (external)
    ep: Option<Endpoint>,
}

/// An active sockaddr listener.
pub struct Listener {
    shared: Arc<ListenerShared>,
    /// The server-mode interface; present from creation until destroy
    iface: Option<Box<dyn ServerIface>>,
}

impl Listener {
    /// The address the underlying interface actually bound (resolves an
    /// ephemeral port request)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.iface
            .as_ref()
            .map_or(self.shared.sockaddr, |iface| iface.local_addr())
    }

    /// Destroy the listener.
    ///
    /// Tears down the underlying interface synchronously; accept items
    /// already queued on the worker are dropped when they run. Taking
    /// `self` by value makes a second destroy unrepresentable.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        // Synchronous interface teardown: after this, the async thread is
        // gone and no further requests can arrive.
        self.iface.take();
        log::debug!("[LISTENER] destroyed listener on {}", self.shared.sockaddr);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("sockaddr", &self.shared.sockaddr)
            .field("iface", &self.iface.is_some())
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.iface.is_some() {
            self.teardown();
        }
    }
}

/// Listen for sockaddr connection requests on behalf of `worker`.
///
/// Walks the worker's transport resources in registration order and opens
/// a server-mode interface on the first one whose memory domain advertises
/// sockaddr capability and reports the address as locally accessible. The
/// first accessible resource wins; if opening its interface fails, that
/// error is returned rather than trying further resources.
///
/// # Errors
///
/// - [`Error::InvalidParam`] if the sockaddr field is missing or absent,
///   or the accept-handler bit is set without a callback
/// - [`Error::InvalidAddr`] if no resource can bind the sockaddr
/// - [`Error::Transport`] if the chosen resource fails to open
pub fn listen(worker: &Worker, params: &ListenerParams) -> Result<Listener> {
    // Worker critical section: serializes listener setup against progress
    // and blocks deferred dispatch for the duration. Held to every return.
    let _cs = worker.critical_section();

    if params.field_mask & LISTENER_PARAM_FIELD_SOCKADDR == 0 {
        log::error!("[LISTENER] missing sockaddr for listener");
        return Err(Error::InvalidParam("missing sockaddr for listener".into()));
    }
    let Some(sockaddr) = params.sockaddr else {
        log::error!("[LISTENER] sockaddr field bit set but address is absent");
        return Err(Error::InvalidParam("listener sockaddr is absent".into()));
    };

    for resource in worker.resources() {
        if !resource.md.capabilities().sockaddr
            || !resource
                .md
                .is_sockaddr_accessible(&sockaddr, SockaddrAccess::Local)
        {
            continue;
        }

        let cb = if params.field_mask & LISTENER_PARAM_FIELD_ACCEPT_HANDLER != 0 {
            match params.accept_handler.cb.clone() {
                Some(cb) => Some(cb),
                None => {
                    log::error!("[LISTENER] accept handler bit set but callback is absent");
                    return Err(Error::InvalidParam(
                        "accept handler bit set but callback is absent".into(),
                    ));
                }
            }
        } else {
            None
        };

        let shared = Arc::new(ListenerShared {
            sockaddr,
            cb,
            closed: AtomicBool::new(false),
        });

        let conn_cb = conn_request_callback(Arc::clone(worker.shared()), Arc::clone(&shared));

        // First accessible resource wins; its open failure is terminal.
        // The partially built record is dropped on this path.
        let iface = resource
            .component
            .open_server(ServerIfaceParams {
                listen_sockaddr: sockaddr,
                conn_request_cb: conn_cb,
                cb_flags: CbFlags::ASYNC,
            })
            .map_err(Error::Transport)?;

        log::debug!(
            "[LISTENER] accepting connections on {} via '{}'",
            sockaddr,
            resource.name
        );

        return Ok(Listener {
            shared,
            iface: Some(iface),
        });
    }

    log::error!(
        "[LISTENER] none of the available transports can listen for connections on {sockaddr}"
    );
    Err(Error::InvalidAddr(sockaddr))
}

/// Build the connection-request callback for one listener (the deferred
/// dispatch bridge).
///
/// Runs on the transport async thread: stages an accept record and
/// registers a one-shot progress item that invokes the user callback from
/// the worker thread. This is the only cross-thread hand-off between the
/// transport callback thread and the worker.
fn conn_request_callback(
    worker: Arc<WorkerShared>,
    listener: Arc<ListenerShared>,
) -> ConnRequestCallback {
    Arc::new(move |request: &ConnRequest<'_>| {
        log::debug!(
            "[LISTENER] connection request from {} on {}",
            request.remote_addr,
            listener.sockaddr
        );

        // Fire-and-forget acceptance when no user callback is installed.
        let Some(cb) = listener.cb.clone() else {
            return Ok(());
        };

        let record = AcceptRecord {
            listener: Arc::clone(&listener),
            ep: None,
        };

        // Defer the user callback onto the worker thread. The one-shot
        // item consumes the record exactly once and frees it.
        let prog_id = worker.progress_register_safe(move || {
            if record.listener.closed.load(Ordering::Acquire) {
                log::debug!(
                    "[LISTENER] dropping accept item for destroyed listener on {}",
                    record.listener.sockaddr
                );
                return;
            }
            cb(record.ep);
        });
        log::trace!("[LISTENER] deferred accept as progress item {prog_id:?}");

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MdCapabilities, MemoryDomain, TlComponent, TlResource};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    /// Memory domain with scripted capability answers.
    struct FakeMd {
        sockaddr_cap: bool,
        accessible: bool,
    }

    impl MemoryDomain for FakeMd {
        fn capabilities(&self) -> MdCapabilities {
            MdCapabilities {
                sockaddr: self.sockaddr_cap,
            }
        }

        fn is_sockaddr_accessible(&self, _addr: &SocketAddr, _access: SockaddrAccess) -> bool {
            self.accessible
        }
    }

    /// Component that captures the connection-request callback so tests
    /// can play the transport async thread.
    struct FakeComponent {
        fail_open: bool,
        opened: Arc<AtomicUsize>,
        captured_cb: Arc<Mutex<Option<ConnRequestCallback>>>,
    }

    struct FakeIface {
        addr: SocketAddr,
    }

    impl ServerIface for FakeIface {
        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
    }

    impl TlComponent for FakeComponent {
        fn open_server(&self, params: ServerIfaceParams) -> io::Result<Box<dyn ServerIface>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "scripted failure"));
            }
            *self.captured_cb.lock() = Some(params.conn_request_cb);
            Ok(Box::new(FakeIface {
                addr: params.listen_sockaddr,
            }))
        }
    }

    struct FakeTransport {
        resource: TlResource,
        opened: Arc<AtomicUsize>,
        captured_cb: Arc<Mutex<Option<ConnRequestCallback>>>,
    }

    fn fake_transport(name: &'static str, accessible: bool, fail_open: bool) -> FakeTransport {
        let opened = Arc::new(AtomicUsize::new(0));
        let captured_cb = Arc::new(Mutex::new(None));
        let resource = TlResource {
            name,
            md: Arc::new(FakeMd {
                sockaddr_cap: true,
                accessible,
            }),
            component: Arc::new(FakeComponent {
                fail_open,
                opened: Arc::clone(&opened),
                captured_cb: Arc::clone(&captured_cb),
            }),
        };
        FakeTransport {
            resource,
            opened,
            captured_cb,
        }
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn fire_request(cb: &ConnRequestCallback) -> Result<()> {
        cb(&ConnRequest {
            remote_addr: "127.0.0.1:54321".parse().unwrap(),
            priv_data: &[],
        })
    }

    #[test]
    fn test_missing_sockaddr_field_is_invalid_param() {
        let worker = Worker::new();
        let err = listen(&worker, &ListenerParams::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn test_sockaddr_bit_without_address_is_invalid_param() {
        let worker = Worker::new();
        let params = ListenerParams {
            field_mask: LISTENER_PARAM_FIELD_SOCKADDR,
            sockaddr: None,
            accept_handler: AcceptHandler::default(),
        };
        let err = listen(&worker, &params).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn test_handler_bit_without_callback_is_invalid_param() {
        let worker = Worker::new();
        worker.register_resource(fake_transport("a", true, false).resource);

        let params = ListenerParams {
            field_mask: LISTENER_PARAM_FIELD_SOCKADDR | LISTENER_PARAM_FIELD_ACCEPT_HANDLER,
            sockaddr: Some(test_addr()),
            accept_handler: AcceptHandler { cb: None },
        };
        let err = listen(&worker, &params).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn test_no_accessible_resource_is_invalid_addr() {
        let worker = Worker::new();
        // One domain without sockaddr capability, one that rejects the address.
        worker.register_resource(TlResource {
            name: "nocap",
            md: Arc::new(FakeMd {
                sockaddr_cap: false,
                accessible: true,
            }),
            component: Arc::new(FakeComponent {
                fail_open: false,
                opened: Arc::new(AtomicUsize::new(0)),
                captured_cb: Arc::new(Mutex::new(None)),
            }),
        });
        worker.register_resource(fake_transport("reject", false, false).resource);

        let params = ListenerParams::new().with_sockaddr(test_addr());
        let err = listen(&worker, &params).unwrap_err();
        assert!(matches!(err, Error::InvalidAddr(_)));
    }

    #[test]
    fn test_first_accessible_resource_wins() {
        let worker = Worker::new();
        let skipped = fake_transport("inaccessible", false, false);
        let first = fake_transport("first", true, false);
        let second = fake_transport("second", true, false);
        worker.register_resource(skipped.resource.clone());
        worker.register_resource(first.resource.clone());
        worker.register_resource(second.resource.clone());

        let params = ListenerParams::new().with_sockaddr(test_addr());
        let listener = listen(&worker, &params).expect("listen");

        assert_eq!(skipped.opened.load(Ordering::SeqCst), 0);
        assert_eq!(first.opened.load(Ordering::SeqCst), 1);
        assert_eq!(second.opened.load(Ordering::SeqCst), 0);
        listener.destroy();
    }

    #[test]
    fn test_open_failure_is_terminal_not_fallthrough() {
        let worker = Worker::new();
        let failing = fake_transport("failing", true, true);
        let fallback = fake_transport("fallback", true, false);
        worker.register_resource(failing.resource.clone());
        worker.register_resource(fallback.resource.clone());

        let params = ListenerParams::new().with_sockaddr(test_addr());
        let err = listen(&worker, &params).unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(failing.opened.load(Ordering::SeqCst), 1);
        // The observed semantics: no fall-through to the next resource.
        assert_eq!(fallback.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_requests_dispatch_in_order_on_worker() {
        let worker = Worker::new();
        let transport = fake_transport("t", true, false);
        worker.register_resource(transport.resource.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let params = ListenerParams::new()
            .with_sockaddr(test_addr())
            .with_accept_handler(Arc::new(move |ep| {
                assert!(ep.is_none()); // wire-up happens later, externally
                let mut order = s.lock();
                let next = order.len();
                order.push(next);
            }));

        let listener = listen(&worker, &params).expect("listen");
        let cb = transport.captured_cb.lock().clone().expect("captured cb");

        // Play the transport async thread: N requests back to back.
        let async_thread = std::thread::spawn(move || {
            for _ in 0..5 {
                fire_request(&cb).expect("request accepted");
            }
        });
        async_thread.join().unwrap();

        // Nothing runs until the worker progresses.
        assert!(seen.lock().is_empty());
        assert_eq!(worker.progress(), 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);

        listener.destroy();
    }

    #[test]
    fn test_no_callback_is_fire_and_forget() {
        let worker = Worker::new();
        let transport = fake_transport("t", true, false);
        worker.register_resource(transport.resource.clone());

        let params = ListenerParams::new().with_sockaddr(test_addr());
        let listener = listen(&worker, &params).expect("listen");
        let cb = transport.captured_cb.lock().clone().expect("captured cb");

        fire_request(&cb).expect("accepted");
        // No user callback -> nothing was deferred.
        assert_eq!(worker.shared().pending_items(), 0);
        assert_eq!(worker.progress(), 0);

        listener.destroy();
    }

    #[test]
    fn test_destroy_drops_pending_dispatch() {
        // S6: request enqueued, destroy before the worker progresses.
        let worker = Worker::new();
        let transport = fake_transport("t", true, false);
        worker.register_resource(transport.resource.clone());

        let invoked = Arc::new(AtomicUsize::new(0));
        let i = Arc::clone(&invoked);
        let params = ListenerParams::new()
            .with_sockaddr(test_addr())
            .with_accept_handler(Arc::new(move |_| {
                i.fetch_add(1, Ordering::SeqCst);
            }));

        let listener = listen(&worker, &params).expect("listen");
        let cb = transport.captured_cb.lock().clone().expect("captured cb");

        fire_request(&cb).expect("accepted");
        assert_eq!(worker.shared().pending_items(), 1);

        listener.destroy();

        // The queued item runs but must not reach the user callback.
        assert_eq!(worker.progress(), 1);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_local_addr_reports_iface_binding() {
        let worker = Worker::new();
        let transport = fake_transport("t", true, false);
        worker.register_resource(transport.resource.clone());

        let params = ListenerParams::new().with_sockaddr(test_addr());
        let listener = listen(&worker, &params).expect("listen");
        assert_eq!(listener.local_addr(), test_addr());
        listener.destroy();
    }
}
