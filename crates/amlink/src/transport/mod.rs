// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layer: capability oracles, interface opening, active-message
//! dispatch.
//!
//! The worker keeps a table of [`TlResource`] entries, each pairing a
//! [`MemoryDomain`] (what the transport can address) with a
//! [`TlComponent`] (how to open interfaces on it). The listener walks this
//! table in registration order; the shared-memory transport lives in
//! [`shm`] and the sockaddr server transport in [`sockaddr`].
//!
//! # Modules
//!
//! - `shm` - Shared memory FIFO transport (receive side + peer producer)
//! - `sockaddr` - TCP-based sockaddr server transport (accept thread)

/// Shared memory FIFO transport.
pub mod shm;
/// Sockaddr server transport backed by TCP.
pub mod sockaddr;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;

// ============================================================================
// Memory domain
// ============================================================================

/// Access scope for sockaddr reachability queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockaddrAccess {
    /// Can the sockaddr be bound locally (server side)?
    Local,
    /// Can the sockaddr be reached remotely (client side)?
    Remote,
}

/// Capability flags reported by a memory domain.
#[derive(Clone, Copy, Debug, Default)]
pub struct MdCapabilities {
    /// The domain can address the socket namespace
    pub sockaddr: bool,
}

/// Capability oracle describing what a transport can address.
///
/// The listener consults this before opening an interface: a resource is a
/// candidate only if its domain advertises sockaddr capability and reports
/// the given address as locally accessible.
pub trait MemoryDomain: Send + Sync {
    /// Capability flags of this domain
    fn capabilities(&self) -> MdCapabilities;

    /// Whether `addr` is accessible from this domain in the given scope
    fn is_sockaddr_accessible(&self, addr: &SocketAddr, access: SockaddrAccess) -> bool;
}

// ============================================================================
// Server-mode interface opening
// ============================================================================

/// Callback flags for interface parameters.
///
/// `ASYNC` marks the connection-request callback as running on the
/// transport's asynchronous thread rather than the worker thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CbFlags(u32);

impl CbFlags {
    /// Callback may run from the transport async thread
    pub const ASYNC: CbFlags = CbFlags(1 << 0);

    /// Whether the async bit is set
    #[must_use]
    pub fn is_async(self) -> bool {
        self.0 & Self::ASYNC.0 != 0
    }
}

/// An inbound connection request, delivered to the connection-request
/// callback on the transport async thread.
#[derive(Debug)]
pub struct ConnRequest<'a> {
    /// Remote peer address as seen by the transport
    pub remote_addr: SocketAddr,
    /// Client-supplied private data, if the transport carries any
    pub priv_data: &'a [u8],
}

/// Connection-request callback.
///
/// Runs on the transport async thread. Returning an error rejects the
/// request; `Error::NoMemory` in particular means the accept context could
/// not be staged and the transport drops the connection.
pub type ConnRequestCallback = Arc<dyn Fn(&ConnRequest<'_>) -> Result<()> + Send + Sync>;

/// Parameters for opening an interface in server-mode sockaddr.
pub struct ServerIfaceParams {
    /// Address to listen on
    pub listen_sockaddr: SocketAddr,
    /// Invoked per inbound connection request
    pub conn_request_cb: ConnRequestCallback,
    /// Callback execution flags; the listener always passes `ASYNC`
    pub cb_flags: CbFlags,
}

/// An opened server-mode interface.
///
/// Teardown is synchronous: dropping the interface stops the accept thread
/// and releases the bound socket before returning.
pub trait ServerIface: Send {
    /// The address the interface actually bound (resolves port 0)
    fn local_addr(&self) -> SocketAddr;
}

/// Opens interfaces on one transport.
pub trait TlComponent: Send + Sync {
    /// Open an interface in server-mode sockaddr
    fn open_server(&self, params: ServerIfaceParams) -> io::Result<Box<dyn ServerIface>>;
}

/// One entry in the worker's transport resource table.
///
/// Resources are consulted in registration order; the first whose domain
/// accepts the sockaddr wins.
#[derive(Clone)]
pub struct TlResource {
    /// Transport name, e.g. `"tcp"`
    pub name: &'static str,
    /// Capability oracle for this transport
    pub md: Arc<dyn MemoryDomain>,
    /// Interface factory for this transport
    pub component: Arc<dyn TlComponent>,
}

// ============================================================================
// Active-message dispatch
// ============================================================================

/// Outcome of an active-message dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmStatus {
    /// The handler finished with the data; the receive descriptor can be
    /// reused in place for the next element.
    Consumed,
    /// The handler took ownership of the receive descriptor and will return
    /// it later via `release_am_desc`.
    Held,
}

/// User area of the receive descriptor handed to a dispatch.
///
/// `handle` identifies the descriptor for a later `release_am_desc` call if
/// the handler returns [`AmStatus::Held`]; `data` is the descriptor's user
/// head-room plus payload area (the bookkeeping head is skipped).
pub struct AmDesc<'a> {
    /// Pool handle of the backing descriptor
    pub handle: shm::DescHandle,
    /// User head-room + payload area
    pub data: &'a mut [u8],
}

/// Active-message dispatch table, consumed by the shared-memory interface.
///
/// Handler registration lives outside this crate; the interface only needs
/// the invoke seam.
pub trait AmDispatch {
    /// Invoke the handler bound to `am_id` with the element payload and the
    /// current receive descriptor.
    fn invoke_am(&mut self, am_id: u8, data: &[u8], desc: AmDesc<'_>) -> AmStatus;
}

/// A drainable interface the worker can progress.
pub trait Progressable {
    /// Drain pending work; returns the number of items processed
    fn progress(&mut self) -> usize;
}
