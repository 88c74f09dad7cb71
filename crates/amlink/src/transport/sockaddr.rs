// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP-backed sockaddr server transport.
//!
//! Supplies the concrete [`MemoryDomain`]/[`TlComponent`] pair the listener
//! consults for the socket namespace. The server-mode interface runs a mio
//! poll loop on a dedicated accept thread; every inbound connection invokes
//! the connection-request callback from that thread (async context).
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------+
//! |              accept thread                  |
//! |  +---------------------------------------+  |
//! |  |              mio::Poll                |  |
//! |  |  - TcpListener (inbound requests)     |  |
//! |  |  - Waker      (shutdown signal)       |  |
//! |  +---------------------------------------+  |
//! |                   |                         |
//! |                   v                         |
//! |        conn_request_cb(request)             |
//! +---------------------------------------------+
//! ```
//!
//! Teardown is synchronous: dropping the interface raises the stop flag,
//! wakes the poll, and joins the thread before returning.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use super::{
    ConnRequest, ConnRequestCallback, MdCapabilities, MemoryDomain, ServerIface,
    ServerIfaceParams, SockaddrAccess, TlComponent, TlResource,
};

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (shutdown signal)
const WAKER_TOKEN: Token = Token(1);

/// Poll timeout; bounds shutdown latency if a wake is lost
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events per poll
const MAX_EVENTS: usize = 16;

/// Listen backlog
const LISTEN_BACKLOG: i32 = 128;

// ============================================================================
// Memory domain
// ============================================================================

/// Capability oracle for the socket namespace.
///
/// A sockaddr is locally accessible when its IP is loopback, unspecified,
/// or assigned to one of the host's interfaces.
pub struct TcpMemoryDomain;

impl MemoryDomain for TcpMemoryDomain {
    fn capabilities(&self) -> MdCapabilities {
        MdCapabilities { sockaddr: true }
    }

    fn is_sockaddr_accessible(&self, addr: &SocketAddr, access: SockaddrAccess) -> bool {
        match access {
            SockaddrAccess::Local => is_local_ip(addr.ip()),
            SockaddrAccess::Remote => !addr.ip().is_unspecified(),
        }
    }
}

/// Whether `ip` can be bound on this host.
fn is_local_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    match local_ip_address::list_afinet_netifas() {
        Ok(netifas) => netifas.iter().any(|(_, ifa)| *ifa == ip),
        Err(e) => {
            log::warn!("[TCP] interface enumeration failed: {e}");
            false
        }
    }
}

// ============================================================================
// Component
// ============================================================================

/// Interface factory for the TCP sockaddr transport.
pub struct TcpComponent;

impl TlComponent for TcpComponent {
    fn open_server(&self, params: ServerIfaceParams) -> io::Result<Box<dyn ServerIface>> {
        TcpServerIface::open(params).map(|iface| Box::new(iface) as Box<dyn ServerIface>)
    }
}

/// The TCP transport as a worker resource entry.
#[must_use]
pub fn tcp_resource() -> TlResource {
    TlResource {
        name: "tcp",
        md: Arc::new(TcpMemoryDomain),
        component: Arc::new(TcpComponent),
    }
}

// ============================================================================
// Server-mode interface
// ============================================================================

/// TCP server-mode interface: bound listener plus accept thread.
pub struct TcpServerIface {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl TcpServerIface {
    /// Bind the listen sockaddr and start the accept thread.
    fn open(params: ServerIfaceParams) -> io::Result<Self> {
        debug_assert!(
            params.cb_flags.is_async(),
            "tcp connection-request callbacks always run from the accept thread"
        );

        let listener = bind_listener(params.listen_sockaddr)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let cb = params.conn_request_cb;

        let handle = thread::Builder::new()
            .name("amlink-tcp-accept".to_string())
            .spawn(move || accept_loop(poll, listener, &cb, &thread_running))?;

        log::debug!("[TCP] server iface listening on {local_addr}");

        Ok(Self {
            local_addr,
            running,
            waker,
            handle: Some(handle),
        })
    }
}

impl ServerIface for TcpServerIface {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpServerIface {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("[TCP] failed to wake accept thread for shutdown: {e}");
        }
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
        log::debug!("[TCP] server iface on {} stopped", self.local_addr);
    }
}

/// Create a bound, non-blocking listen socket.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Accept-thread body: poll until the stop flag is raised.
fn accept_loop(
    mut poll: Poll,
    mut listener: TcpListener,
    cb: &ConnRequestCallback,
    running: &AtomicBool,
) {
    let mut events = Events::with_capacity(MAX_EVENTS);

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[TCP] poll failed: {e}");
            break;
        }

        for event in events.iter() {
            match event.token() {
                // Shutdown signal; the loop condition does the rest.
                WAKER_TOKEN => {}
                LISTENER_TOKEN => accept_pending(&mut listener, cb),
                _ => {}
            }
        }
    }
}

/// Drain the accept queue, invoking the connection-request callback per
/// inbound request.
fn accept_pending(listener: &mut TcpListener, cb: &ConnRequestCallback) {
    loop {
        match listener.accept() {
            Ok((stream, remote_addr)) => {
                let request = ConnRequest {
                    remote_addr,
                    priv_data: &[],
                };
                match cb(&request) {
                    Ok(()) => {
                        log::debug!("[TCP] connection request from {remote_addr} accepted");
                    }
                    Err(e) => {
                        log::warn!("[TCP] connection request from {remote_addr} rejected: {e}");
                    }
                }
                // Endpoint wire-up belongs to a later layer; the request
                // socket is released here either way.
                drop(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::error!("[TCP] accept failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CbFlags;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_md_advertises_sockaddr() {
        assert!(TcpMemoryDomain.capabilities().sockaddr);
    }

    #[test]
    fn test_loopback_is_locally_accessible() {
        let md = TcpMemoryDomain;
        assert!(md.is_sockaddr_accessible(&loopback(0), SockaddrAccess::Local));
        assert!(md.is_sockaddr_accessible(&"0.0.0.0:0".parse().unwrap(), SockaddrAccess::Local));
    }

    #[test]
    fn test_foreign_addr_not_locally_accessible() {
        // TEST-NET-1; never assigned to a local interface.
        let md = TcpMemoryDomain;
        assert!(!md.is_sockaddr_accessible(&"192.0.2.1:0".parse().unwrap(), SockaddrAccess::Local));
    }

    #[test]
    fn test_open_fails_on_unbindable_addr() {
        let params = ServerIfaceParams {
            listen_sockaddr: "192.0.2.1:80".parse().unwrap(),
            conn_request_cb: Arc::new(|_| Ok(())),
            cb_flags: CbFlags::ASYNC,
        };
        assert!(TcpServerIface::open(params).is_err());
    }

    #[test]
    fn test_accept_invokes_callback() {
        let requests = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&requests);
        let params = ServerIfaceParams {
            listen_sockaddr: loopback(0),
            conn_request_cb: Arc::new(move |_req| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            cb_flags: CbFlags::ASYNC,
        };

        let iface = TcpServerIface::open(params).expect("open");
        let addr = ServerIface::local_addr(&iface);
        assert_ne!(addr.port(), 0);

        let _conn = TcpStream::connect(addr).expect("connect");

        // The accept thread races the assertion; poll with a deadline.
        let deadline = Instant::now() + Duration::from_secs(5);
        while requests.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_port() {
        let params = ServerIfaceParams {
            listen_sockaddr: loopback(0),
            conn_request_cb: Arc::new(|_| Ok(())),
            cb_flags: CbFlags::ASYNC,
        };
        let iface = TcpServerIface::open(params).expect("open");
        let addr = ServerIface::local_addr(&iface);
        drop(iface);

        // Join-on-drop means the socket is closed by now.
        let params = ServerIfaceParams {
            listen_sockaddr: addr,
            conn_request_cb: Arc::new(|_| Ok(())),
            cb_flags: CbFlags::ASYNC,
        };
        let rebound = TcpServerIface::open(params).expect("rebind after drop");
        assert_eq!(ServerIface::local_addr(&rebound), addr);
    }
}
