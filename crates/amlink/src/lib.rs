// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # amlink — host-local transport substrate
//!
//! Two cooperating pieces:
//!
//! - a **sockaddr connection listener** that accepts inbound connection
//!   requests on behalf of a [`Worker`] and defers the user accept
//!   callback onto the worker's progress thread, and
//! - a **shared-memory point-to-point transport** built around a
//!   single-producer/single-consumer cache-line-aligned ring FIFO in a
//!   POSIX shared segment, drained by the worker and dispatched as active
//!   messages.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Worker (progress thread)                    |
//! |   progress(): deferred one-shot items  ->  user accept callbacks   |
//! |               registered ifaces        ->  active-message dispatch |
//! +--------------------------------------------------------------------+
//!        ^                                          ^
//!        | one-shot items (MPSC)                    | SPSC ring FIFO
//! +---------------------+                 +--------------------------+
//! |  Sockaddr listener  |                 |  Shared-memory interface |
//! |  (accept thread)    |                 |  (peer FifoProducer)     |
//! +---------------------+                 +--------------------------+
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amlink::transport::sockaddr::tcp_resource;
//! use amlink::{listen, ListenerParams, Worker};
//! use std::sync::Arc;
//!
//! fn main() -> amlink::Result<()> {
//!     let worker = Worker::new();
//!     worker.register_resource(tcp_resource());
//!
//!     let params = ListenerParams::new()
//!         .with_sockaddr("127.0.0.1:0".parse().unwrap())
//!         .with_accept_handler(Arc::new(|_ep| {
//!             // runs on the worker thread, once per connection request
//!         }));
//!     let listener = listen(&worker, &params)?;
//!
//!     loop {
//!         worker.progress();
//!         # break;
//!     }
//!     # listener.destroy();
//!     # Ok(())
//! }
//! ```
//!
//! ## Modules Overview
//!
//! - [`worker`] - cooperative progress context and the cross-thread
//!   one-shot progress queue
//! - [`listener`] - sockaddr listener and the deferred-dispatch bridge
//! - [`transport`] - capability oracles, interface opening, dispatch seams
//! - [`transport::shm`] - the shared-memory FIFO transport
//!
//! ## Concurrency Model
//!
//! Exactly two thread roles matter: the worker progress thread (runs user
//! callbacks and drains FIFOs) and the transport async thread (runs
//! connection-request callbacks). The only hand-off between them is the
//! worker's one-shot progress queue; the only memory shared between peer
//! address spaces is the FIFO, under the SPSC discipline documented in
//! [`transport::shm`].

/// Crate-level error type and result alias.
pub mod error;
/// Sockaddr connection listener and deferred accept dispatch.
pub mod listener;
/// Transport abstractions and concrete transports.
pub mod transport;
/// Cooperative worker progress context.
pub mod worker;

pub use error::{Error, Result};
pub use listener::{
    listen, AcceptCallback, AcceptHandler, Endpoint, Listener, ListenerParams,
    LISTENER_PARAM_FIELD_ACCEPT_HANDLER, LISTENER_PARAM_FIELD_SOCKADDR,
};
pub use transport::{
    AmDesc, AmDispatch, AmStatus, CbFlags, ConnRequest, ConnRequestCallback, MdCapabilities,
    MemoryDomain, Progressable, ServerIface, ServerIfaceParams, SockaddrAccess, TlComponent,
    TlResource,
};
pub use worker::{ProgressId, Worker, WorkerShared};
