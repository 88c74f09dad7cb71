// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive-side shared-memory interface.
//!
//! [`SmIface`] owns the FIFO region, the consumer cursor, the receive
//! descriptor pool, and the active-message dispatch seam. The worker's
//! progress loop calls [`SmIface::progress`], which drains one element per
//! call:
//!
//! 1. Check the ownership bit of the element at `read_index & fifo_mask`
//! 2. Parse `{am_id, length}`, dispatch the inline payload together with
//!    the cached receive descriptor's user area
//! 3. Consumed: reuse the cached descriptor. Held: refill the cache from
//!    the pool (exhaustion here is fatal — the interface must always hold
//!    a pre-fetched descriptor)
//! 4. Clear the ownership bit, advance `read_index`, publish `tail` when
//!    the release mask says so

use super::desc::{DescHandle, DescPool};
use super::fifo::{fifo_region_size, release_factor_mask, FifoView};
use super::segment::ShmSegment;
use super::{FifoId, Result, ShmConfig, ShmError};
use crate::transport::{AmDesc, AmDispatch, AmStatus, Progressable};

/// Drain counters for one interface
#[derive(Debug, Default, Clone, Copy)]
pub struct SmIfaceMetrics {
    /// Elements drained and dispatched
    pub elements_drained: u64,
    /// Progress calls that found no owned element
    pub empty_polls: u64,
    /// Dispatches after which the handler held the descriptor
    pub descs_held: u64,
}

/// Shared-memory receive interface.
///
/// Created when a worker opens the shared-memory transport; the peer
/// attaches a producer using [`SmIface::identity`]. Single-owner: all
/// methods take place on the worker progress thread.
pub struct SmIface {
    segment: ShmSegment,
    id: FifoId,
    view: FifoView,
    /// Consumer cursor; monotonically increasing, masked for slot lookup
    read_index: u64,
    fifo_shift: u8,
    fifo_mask: u64,
    elem_size: usize,
    fifo_release_factor_mask: u64,
    pool: DescPool,
    /// Pre-fetched descriptor for the next dispatch; never empty
    last_recv_desc: DescHandle,
    dispatch: Box<dyn AmDispatch>,
    metrics: SmIfaceMetrics,
}

impl SmIface {
    /// Allocate the FIFO region and open the interface.
    ///
    /// The region is zero-filled on creation, which initializes the ctl
    /// counters and every element's flags. The descriptor pool is primed
    /// and one descriptor pre-fetched before the interface is returned.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or segment allocation failure.
    pub fn open(config: &ShmConfig, dispatch: Box<dyn AmDispatch>) -> Result<Self> {
        config.validate()?;

        let elem_size = config.elem_size();
        let name = super::next_segment_name();
        let region_size = fifo_region_size(config.fifo_size, elem_size);
        let segment = ShmSegment::create(&name, region_size, config.hugetlb_mode)?;
        let view = FifoView::new(segment.as_ptr(), config.fifo_size, elem_size);

        let fifo_shift = config.fifo_size.trailing_zeros() as u8;
        let fifo_mask = (1u64 << fifo_shift) - 1;
        let fifo_release_factor_mask =
            release_factor_mask(config.fifo_size, config.release_fifo_factor);

        let mut pool = DescPool::new(config.desc_pool_capacity, config.headroom, config.seg_size);
        let last_recv_desc = pool.get().ok_or(ShmError::NoResource)?;

        let id = FifoId {
            name,
            fifo_size: config.fifo_size as u32,
            elem_size: elem_size as u32,
        };

        log::debug!(
            "[SHM] opened interface {}: fifo_size={} elem_size={} release_mask={:#x}",
            id.name,
            config.fifo_size,
            elem_size,
            fifo_release_factor_mask
        );

        Ok(Self {
            segment,
            id,
            view,
            read_index: 0,
            fifo_shift,
            fifo_mask,
            elem_size,
            fifo_release_factor_mask,
            pool,
            last_recv_desc,
            dispatch,
            metrics: SmIfaceMetrics::default(),
        })
    }

    /// Identity a peer uses to attach its producer
    #[must_use]
    pub fn identity(&self) -> FifoId {
        self.id.clone()
    }

    /// Encoded identity string (see [`FifoId::encode`])
    #[must_use]
    pub fn mm_id(&self) -> String {
        self.id.encode()
    }

    /// FIFO depth in elements
    #[must_use]
    pub fn fifo_size(&self) -> usize {
        1usize << self.fifo_shift
    }

    /// Element stride in bytes
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Drain counters
    #[must_use]
    pub fn metrics(&self) -> &SmIfaceMetrics {
        &self.metrics
    }

    /// Drain up to one element and dispatch it.
    ///
    /// Returns the number of elements processed (0 or 1).
    ///
    /// # Panics
    ///
    /// Panics when a handler holds the descriptor and the pool cannot
    /// supply a replacement: the "always one pre-fetched descriptor"
    /// invariant cannot be restored and continuing would corrupt dispatch.
    pub fn progress(&mut self) -> usize {
        let slot = self.read_index & self.fifo_mask;
        let hdr = self.view.elem_hdr(slot);
        if !hdr.is_owned() {
            self.metrics.empty_polls += 1;
            return 0;
        }

        let (am_id, length) = hdr.message();
        // SAFETY: the producer wrote `length` payload bytes into this slot
        // before the Release store our is_owned() acquire-loaded.
        let data =
            unsafe { std::slice::from_raw_parts(self.view.payload_ptr(slot), length as usize) };

        let handle = self.last_recv_desc;
        let status = self.dispatch.invoke_am(
            am_id,
            data,
            AmDesc {
                handle,
                data: self.pool.user_area_mut(handle),
            },
        );

        if status == AmStatus::Held {
            // The handler kept the descriptor; refill the cache before the
            // next element arrives.
            self.metrics.descs_held += 1;
            match self.pool.get() {
                Some(h) => self.last_recv_desc = h,
                None => {
                    log::error!(
                        "[SHM] descriptor pool exhausted on interface {}",
                        self.id.name
                    );
                    panic!(
                        "failed to get a new receive descriptor for interface {}",
                        self.id.name
                    );
                }
            }
        }

        hdr.clear_owner();
        self.read_index += 1;
        if self.read_index & self.fifo_release_factor_mask == 0 {
            self.view.ctl().publish_tail(self.read_index);
        }

        self.metrics.elements_drained += 1;
        1
    }

    /// Return a descriptor a handler previously held.
    pub fn release_am_desc(&mut self, handle: DescHandle) {
        self.pool.release(handle);
    }

    /// Report completion of outstanding transmissions.
    ///
    /// Shared-memory sends complete inside the producer's push, so there
    /// is never anything in flight by the time flush is called.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Close the interface. Undrained elements are abandoned; the segment
    /// name is unlinked and the mapping released.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SmIface {
    fn drop(&mut self) {
        ShmSegment::unlink(self.segment.name()).ok();
        log::debug!(
            "[SHM] closed interface {} (drained={} held={})",
            self.id.name,
            self.metrics.elements_drained,
            self.metrics.descs_held
        );
    }
}

impl Progressable for SmIface {
    fn progress(&mut self) -> usize {
        SmIface::progress(self)
    }
}
