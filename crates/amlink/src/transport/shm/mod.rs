// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory point-to-point transport.
//!
//! A receive-side interface ([`SmIface`]) owns an SPSC ring FIFO in a POSIX
//! shared segment and publishes an identity string a peer uses to attach a
//! [`FifoProducer`]. The worker's progress loop drains the FIFO and
//! dispatches active messages.
//!
//! ```text
//! +------------------+                +------------------+
//! |   Peer process   |    Shared      |  Worker process  |
//! |   FifoProducer --+----------------+--> SmIface       |
//! |   push(am, data) |  ring region   |  progress()      |
//! +------------------+                |    -> dispatch   |
//!                                     +------------------+
//! ```
//!
//! # Modules
//!
//! - `fifo` - ring layout, index arithmetic, producer protocol
//! - `segment` - POSIX shared segment lifecycle
//! - `desc` - bounded receive-descriptor pool
//! - `iface` - the receive interface and its drain loop

mod desc;
mod fifo;
mod iface;
mod segment;

pub use desc::{DescHandle, DescPool};
pub use fifo::{
    align_up, fifo_region_size, release_factor_mask, FifoCtl, FifoElemHdr, FifoProducer,
    ELEM_FLAG_OWNER, FIFO_CTL_SIZE_ALIGNED,
};
pub use iface::{SmIface, SmIfaceMetrics};
pub use segment::{cleanup_stale_segments, ShmSegment};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size the wire layout is aligned to
pub const CACHE_LINE_SIZE: usize = 64;

/// Packed element header size: `{u8 flags, u8 am_id, u16 length}`
pub const FIFO_ELEM_HDR_SIZE: usize = 4;

/// Default receive FIFO depth in elements (power of two)
pub const DEFAULT_FIFO_SIZE: usize = 64;

/// Default payload bytes per element/descriptor
pub const DEFAULT_SEG_SIZE: usize = 8192;

/// Default tail publication factor: tail is refreshed every
/// `fifo_size * factor` drains
pub const DEFAULT_RELEASE_FACTOR: f64 = 0.5;

/// Default receive-descriptor pool depth
pub const DEFAULT_DESC_POOL_CAPACITY: usize = 128;

/// Default user head-room bytes per receive descriptor
pub const DEFAULT_HEADROOM: usize = 64;

/// Prefix of every segment name this crate creates (without the leading
/// `/`); the stale-segment sweep keys on it
pub const SEGMENT_PREFIX: &str = "amlink_fifo_";

/// Identity string layout version
pub const FIFO_ID_VERSION: u32 = 1;

/// Errors of the shared-memory transport
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Segment not found
    NotFound(String),

    /// Invalid segment name
    InvalidName(String),

    /// Payload exceeds the inline element capacity
    PayloadTooLarge { size: usize, capacity: usize },

    /// Ring full or descriptor pool exhausted; retry after progress
    NoResource,

    /// FIFO depth is not a power of two
    InvalidCapacity(usize),

    /// Release factor outside (0, 1]
    InvalidFactor(f64),

    /// Per-descriptor payload size out of range
    InvalidSegSize(usize),

    /// Malformed or version-mismatched identity string
    BadIdentity(String),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::PayloadTooLarge { size, capacity } => {
                write!(
                    f,
                    "Payload too large: {size} bytes exceeds element capacity {capacity}"
                )
            }
            Self::NoResource => write!(f, "No resources available, retry after progress"),
            Self::InvalidCapacity(n) => {
                write!(f, "Invalid FIFO size: {n} (must be a power of 2)")
            }
            Self::InvalidFactor(v) => {
                write!(f, "Invalid release factor: {v} (must be in (0, 1])")
            }
            Self::InvalidSegSize(n) => write!(f, "Invalid seg size: {n}"),
            Self::BadIdentity(s) => write!(f, "Malformed FIFO identity: {s}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for crate::error::Error {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::NoResource => Self::NoResource,
            ShmError::SegmentCreate(io) | ShmError::SegmentOpen(io) | ShmError::Mmap(io) => {
                Self::Transport(io)
            }
            ShmError::NotFound(name) => Self::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment not found: {name}"),
            )),
            other => Self::InvalidParam(other.to_string()),
        }
    }
}

/// Result type for shared-memory transport operations
pub type Result<T> = std::result::Result<T, ShmError>;

// ============================================================================
// Configuration
// ============================================================================

/// Huge-page backing policy for the shared segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HugetlbMode {
    /// Map with default pages
    Never,
    /// Attempt `MAP_HUGETLB`, fall back to default pages
    #[default]
    Try,
    /// Require huge pages; fail if unavailable
    Force,
}

/// Shared-memory interface configuration.
///
/// `seg_size` is the payload capacity per receive descriptor; the element
/// size is `header + seg_size` rounded up to a cache line.
#[derive(Clone, Debug)]
pub struct ShmConfig {
    /// Receive FIFO depth in elements; must be a power of two
    pub fifo_size: usize,
    /// Payload bytes per element/descriptor
    pub seg_size: usize,
    /// Tail publication factor in (0, 1]
    pub release_fifo_factor: f64,
    /// Huge-page backing policy
    pub hugetlb_mode: HugetlbMode,
    /// Receive-descriptor pool depth
    pub desc_pool_capacity: usize,
    /// User head-room bytes per receive descriptor
    pub headroom: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            fifo_size: DEFAULT_FIFO_SIZE,
            seg_size: DEFAULT_SEG_SIZE,
            release_fifo_factor: DEFAULT_RELEASE_FACTOR,
            hugetlb_mode: HugetlbMode::default(),
            desc_pool_capacity: DEFAULT_DESC_POOL_CAPACITY,
            headroom: DEFAULT_HEADROOM,
        }
    }
}

impl ShmConfig {
    /// Configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the FIFO depth
    #[must_use]
    pub fn with_fifo_size(mut self, fifo_size: usize) -> Self {
        self.fifo_size = fifo_size;
        self
    }

    /// Set the per-descriptor payload size
    #[must_use]
    pub fn with_seg_size(mut self, seg_size: usize) -> Self {
        self.seg_size = seg_size;
        self
    }

    /// Set the tail publication factor
    #[must_use]
    pub fn with_release_factor(mut self, factor: f64) -> Self {
        self.release_fifo_factor = factor;
        self
    }

    /// Set the huge-page policy
    #[must_use]
    pub fn with_hugetlb_mode(mut self, mode: HugetlbMode) -> Self {
        self.hugetlb_mode = mode;
        self
    }

    /// Set the descriptor pool depth
    #[must_use]
    pub fn with_desc_pool_capacity(mut self, capacity: usize) -> Self {
        self.desc_pool_capacity = capacity;
        self
    }

    /// Element size implied by this configuration
    #[must_use]
    pub fn elem_size(&self) -> usize {
        align_up(FIFO_ELEM_HDR_SIZE + self.seg_size, CACHE_LINE_SIZE)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Rejects a non-power-of-two FIFO size, a release factor outside
    /// (0, 1], a zero descriptor pool, and a seg size whose element length
    /// would not be representable in the 16-bit header length field.
    pub fn validate(&self) -> Result<()> {
        if !self.fifo_size.is_power_of_two() {
            return Err(ShmError::InvalidCapacity(self.fifo_size));
        }
        if !(self.release_fifo_factor > 0.0 && self.release_fifo_factor <= 1.0) {
            return Err(ShmError::InvalidFactor(self.release_fifo_factor));
        }
        if self.seg_size == 0 || self.elem_size() - FIFO_ELEM_HDR_SIZE > u16::MAX as usize {
            return Err(ShmError::InvalidSegSize(self.seg_size));
        }
        if self.desc_pool_capacity == 0 {
            return Err(ShmError::InvalidSegSize(self.desc_pool_capacity));
        }
        Ok(())
    }
}

// ============================================================================
// FIFO identity
// ============================================================================

/// Identity of a receive FIFO, sufficient for a peer to attach.
///
/// Encodes the segment name plus the geometry and layout version needed to
/// validate the mapping; the region itself carries no header (the wire
/// layout starts directly at the ctl block).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FifoId {
    /// POSIX segment name (leading `/`)
    pub name: String,
    /// FIFO depth in elements
    pub fifo_size: u32,
    /// Element stride in bytes
    pub elem_size: u32,
}

impl FifoId {
    /// Encode as a key=value identity string.
    ///
    /// Format: `name=<segment>;fifo=<n>;elem=<n>;v=<version>`
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "name={};fifo={};elem={};v={}",
            self.name, self.fifo_size, self.elem_size, FIFO_ID_VERSION
        )
    }

    /// Parse an identity string produced by [`FifoId::encode`].
    ///
    /// # Errors
    ///
    /// Rejects missing fields, a version mismatch, and invalid geometry.
    pub fn parse(s: &str) -> Result<Self> {
        let mut name = None;
        let mut fifo_size = None;
        let mut elem_size = None;
        let mut version = None;

        for part in s.split(';') {
            let mut kv = part.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("name"), Some(v)) => name = Some(v.to_string()),
                (Some("fifo"), Some(v)) => fifo_size = v.parse().ok(),
                (Some("elem"), Some(v)) => elem_size = v.parse().ok(),
                (Some("v"), Some(v)) => version = v.parse().ok(),
                _ => {}
            }
        }

        if version != Some(FIFO_ID_VERSION) {
            return Err(ShmError::BadIdentity(s.to_string()));
        }
        let (Some(name), Some(fifo_size), Some(elem_size)) = (name, fifo_size, elem_size) else {
            return Err(ShmError::BadIdentity(s.to_string()));
        };

        let id = Self {
            name,
            fifo_size,
            elem_size,
        };
        id.validate()?;
        Ok(id)
    }

    /// Validate geometry: power-of-two depth, element big enough for the
    /// packed header, segment name well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.fifo_size == 0 || !self.fifo_size.is_power_of_two() {
            return Err(ShmError::InvalidCapacity(self.fifo_size as usize));
        }
        if (self.elem_size as usize) <= FIFO_ELEM_HDR_SIZE {
            return Err(ShmError::InvalidSegSize(self.elem_size as usize));
        }
        if !self.name.starts_with('/') {
            return Err(ShmError::InvalidName(self.name.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for FifoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Next unique segment name for this process.
///
/// Format: `/amlink_fifo_<pid>_<seq>`; the pid keeps names from colliding
/// across processes, the counter within one.
pub(crate) fn next_segment_name() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("/{}{}_{}", SEGMENT_PREFIX, std::process::id(), seq)
}
