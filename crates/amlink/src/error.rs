// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type for the transport substrate.
//!
//! Per-module errors (e.g. [`crate::transport::shm::ShmError`]) convert
//! into this type at the API boundary. Variants map one-to-one onto the
//! status codes the transport layer reports upward.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors surfaced by listener and worker operations.
#[derive(Debug)]
pub enum Error {
    /// A required parameter was missing or malformed
    InvalidParam(String),

    /// The sockaddr is not locally accessible on any registered transport resource
    InvalidAddr(SocketAddr),

    /// Transient allocation failure; the request is rejected, not retried
    NoMemory(&'static str),

    /// A bounded resource (FIFO slot, descriptor) is exhausted; retry after progress
    NoResource,

    /// Failure in the underlying transport
    Transport(io::Error),

    /// Unrecoverable condition; continuing would corrupt dispatch state
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParam(what) => write!(f, "Invalid parameter: {what}"),
            Self::InvalidAddr(addr) => {
                write!(
                    f,
                    "None of the available transports can listen for connections on {addr}"
                )
            }
            Self::NoMemory(what) => write!(f, "Out of memory: {what}"),
            Self::NoResource => write!(f, "No resources available, retry after progress"),
            Self::Transport(e) => write!(f, "Transport failure: {e}"),
            Self::Fatal(what) => write!(f, "Fatal: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for listener and worker operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_addr() {
        let addr: SocketAddr = "192.0.2.7:4791".parse().unwrap();
        let msg = Error::InvalidAddr(addr).to_string();
        assert!(msg.contains("192.0.2.7:4791"));
    }

    #[test]
    fn test_transport_source_chain() {
        let err = Error::Transport(io::Error::new(io::ErrorKind::AddrInUse, "bind"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(std::error::Error::source(&Error::NoResource).is_none());
    }
}
