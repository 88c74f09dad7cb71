// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FIFO layout and index arithmetic for the shared-memory ring.
//!
//! # Memory Layout (wire-visible, shared between address spaces)
//!
//! ```text
//! offset 0 ........... up to (cache_line - 1) padding
//! aligned            struct { u64 head; u64 tail; }   // FifoCtl
//! aligned + 64       elem[0], elem[1], ..., elem[fifo_size - 1]
//! each elem          { u8 flags; u8 am_id; u16 length; u8 payload[elem_size - 4]; }
//! ```
//!
//! The ctl block is placed at the first cache-line-aligned address at or
//! after the region start; the raw region carries `cache_line - 1` bytes of
//! slack so this always fits. Element `i` sits at
//! `elems + (i & fifo_mask) * elem_size`.
//!
//! # Synchronization Protocol
//!
//! One producer, one consumer per FIFO.
//!
//! Producer push:
//! 1. Read `head` (own cursor, plain load) and `tail` (Acquire)
//! 2. `head - tail == fifo_size` -> fail with no-resource, caller retries
//! 3. Write header fields and payload into the slot
//! 4. Publish: set the owned-by-consumer bit in `flags` (Release)
//! 5. Advance `head` (Release)
//!
//! Consumer drain (driven by the interface):
//! 1. Load slot `flags` (Acquire); bail if the ownership bit is clear
//! 2. Parse `{am_id, length}`, dispatch the payload
//! 3. Clear the ownership bit (Release), advance the local read index
//! 4. Publish `tail = read_index` (Release) only when
//!    `read_index & release_mask == 0`, bounding ctl-line ping-pong

use super::segment::ShmSegment;
use super::{FifoId, Result, ShmError, CACHE_LINE_SIZE, FIFO_ELEM_HDR_SIZE};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Element flag bit: slot holds a completed write the consumer now owns.
/// Remaining bits are reserved.
pub const ELEM_FLAG_OWNER: u8 = 1 << 0;

/// Round `v` up to a multiple of `align` (power of two)
#[inline]
#[must_use]
pub const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Ctl block size after cache-line alignment (one full line)
pub const FIFO_CTL_SIZE_ALIGNED: usize =
    align_up(std::mem::size_of::<FifoCtl>(), CACHE_LINE_SIZE);

/// Total byte size of a FIFO region.
///
/// The `cache_line - 1` slack guarantees the aligned ctl block and the
/// element array fit regardless of where the OS places the raw mapping.
#[must_use]
pub const fn fifo_region_size(fifo_size: usize, elem_size: usize) -> usize {
    CACHE_LINE_SIZE - 1 + FIFO_CTL_SIZE_ALIGNED + fifo_size * elem_size
}

/// Mask derived from the release factor: `tail` is published whenever
/// `read_index & mask == 0`, i.e. every `max(1, fifo_size * factor)` drains
/// rounded up to a power of two.
#[must_use]
pub fn release_factor_mask(fifo_size: usize, factor: f64) -> u64 {
    let interval = (fifo_size as f64 * factor).max(1.0) as usize;
    interval.next_power_of_two() as u64 - 1
}

// ============================================================================
// Ctl block
// ============================================================================

/// FIFO control block: producer and consumer cursors.
///
/// Lives at the first cache-line-aligned address of the shared region.
/// Field order and width are wire-visible; `repr(C)` with two naturally
/// aligned u64s matches the packed `{u64 head; u64 tail}` layout exactly.
#[repr(C)]
pub struct FifoCtl {
    /// Next slot index the producer will write
    pub head: AtomicU64,
    /// Number of slots the consumer has read, published periodically
    pub tail: AtomicU64,
}

impl FifoCtl {
    /// Producer-side head read. The producer is the only writer of `head`,
    /// so a relaxed load of its own cursor is sufficient.
    #[inline]
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Relaxed)
    }

    /// Publish a new head. Release pairs with the consumer's acquire in
    /// case it consults `head` for lag accounting.
    #[inline]
    pub fn publish_head(&self, new_head: u64) {
        self.head.store(new_head, Ordering::Release);
    }

    /// Producer-side tail read. Acquire pairs with `publish_tail` so the
    /// producer never reuses a slot the consumer is still parsing.
    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Consumer-side tail publication (periodic, per the release mask).
    #[inline]
    pub fn publish_tail(&self, read_index: u64) {
        self.tail.store(read_index, Ordering::Release);
    }
}

// ============================================================================
// Element header
// ============================================================================

/// Packed element header: `{u8 flags, u8 am_id, u16 length}`.
///
/// `flags` is the only field written concurrently (producer sets the
/// ownership bit, consumer clears it — never at the same time, because the
/// producer reuses a slot only after `tail` covers it). `am_id` and
/// `length` are plain cells ordered by the flags release/acquire pair.
#[repr(C)]
pub struct FifoElemHdr {
    /// Arrival flags; bit 0 is [`ELEM_FLAG_OWNER`]
    pub flags: AtomicU8,
    am_id: UnsafeCell<u8>,
    length: UnsafeCell<u16>,
}

// SAFETY: cross-thread access to the plain cells is ordered by the flags
// acquire/release protocol documented on the struct.
unsafe impl Sync for FifoElemHdr {}

impl FifoElemHdr {
    /// Whether the slot holds a completed write (consumer side, Acquire)
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ELEM_FLAG_OWNER != 0
    }

    /// Write the message header fields. Producer only, before publishing.
    #[inline]
    pub fn set_message(&self, am_id: u8, length: u16) {
        // SAFETY: the producer holds the slot exclusively until the Release
        // store of the ownership bit; the consumer reads these only after
        // its Acquire load observes that bit.
        unsafe {
            *self.am_id.get() = am_id;
            *self.length.get() = length;
        }
    }

    /// Publish the slot to the consumer (Release)
    #[inline]
    pub fn publish(&self) {
        self.flags.store(ELEM_FLAG_OWNER, Ordering::Release);
    }

    /// Parse `{am_id, length}`. Consumer only, after `is_owned()`.
    #[inline]
    pub fn message(&self) -> (u8, u16) {
        // SAFETY: ordered after the producer's writes by the Acquire load
        // in is_owned().
        unsafe { (*self.am_id.get(), *self.length.get()) }
    }

    /// Return the slot to the producer (Release, consumer side)
    #[inline]
    pub fn clear_owner(&self) {
        let flags = self.flags.load(Ordering::Relaxed);
        self.flags.store(flags & !ELEM_FLAG_OWNER, Ordering::Release);
    }
}

// ============================================================================
// Region view
// ============================================================================

/// Pointer arithmetic over a raw FIFO region.
///
/// Both sides of a FIFO build one of these over their own mapping of the
/// same region; all cross-process synchronization goes through the atomics
/// it exposes.
pub(crate) struct FifoView {
    ctl: *mut FifoCtl,
    elems: *mut u8,
    fifo_size: u64,
    fifo_mask: u64,
    elem_size: usize,
}

// SAFETY: the view only holds pointers into a mapping that outlives it
// (enforced by the owning types); concurrent access follows the SPSC
// protocol above.
unsafe impl Send for FifoView {}

impl FifoView {
    /// Build a view over `region`, which must span at least
    /// `fifo_region_size(fifo_size, elem_size)` bytes and stay mapped for
    /// the lifetime of the view. `fifo_size` must be a power of two.
    pub fn new(region: *mut u8, fifo_size: usize, elem_size: usize) -> Self {
        debug_assert!(fifo_size.is_power_of_two());
        debug_assert!(elem_size > FIFO_ELEM_HDR_SIZE);

        let ctl = align_up(region as usize, CACHE_LINE_SIZE) as *mut FifoCtl;
        let elems = (ctl as usize + FIFO_CTL_SIZE_ALIGNED) as *mut u8;

        Self {
            ctl,
            elems,
            fifo_size: fifo_size as u64,
            fifo_mask: fifo_size as u64 - 1,
            elem_size,
        }
    }

    /// The ctl block
    #[inline]
    pub fn ctl(&self) -> &FifoCtl {
        // SAFETY: ctl points at the aligned, zero-initialized ctl block
        // inside the live mapping; FifoCtl is all-atomic.
        unsafe { &*self.ctl }
    }

    /// Header of element `index & fifo_mask`
    #[inline]
    pub fn elem_hdr(&self, index: u64) -> &FifoElemHdr {
        // SAFETY: the masked index stays inside the element array; the
        // header struct matches the first 4 bytes of the slot.
        unsafe { &*(self.elem_ptr(index) as *const FifoElemHdr) }
    }

    /// Payload area of element `index & fifo_mask`
    #[inline]
    pub fn payload_ptr(&self, index: u64) -> *mut u8 {
        // SAFETY: elem_ptr is in bounds and the payload starts right after
        // the 4-byte header.
        unsafe { self.elem_ptr(index).add(FIFO_ELEM_HDR_SIZE) }
    }

    /// Payload capacity of one element
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.elem_size - FIFO_ELEM_HDR_SIZE
    }

    #[inline]
    fn elem_ptr(&self, index: u64) -> *mut u8 {
        let slot = (index & self.fifo_mask) as usize;
        // SAFETY: slot < fifo_size, so the offset is within the array.
        unsafe { self.elems.add(slot * self.elem_size) }
    }

    /// Producer push: reserve the head slot, write header + payload,
    /// publish ownership, advance head.
    ///
    /// # Errors
    ///
    /// [`ShmError::NoResource`] when the ring is full (`head - tail ==
    /// fifo_size`); the caller retries after the consumer progresses.
    /// [`ShmError::PayloadTooLarge`] when the payload exceeds the inline
    /// element capacity.
    pub fn try_push(&self, am_id: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > self.payload_capacity() {
            return Err(ShmError::PayloadTooLarge {
                size: payload.len(),
                capacity: self.payload_capacity(),
            });
        }

        let ctl = self.ctl();
        let head = ctl.head();
        if head.wrapping_sub(ctl.tail()) >= self.fifo_size {
            return Err(ShmError::NoResource);
        }

        let hdr = self.elem_hdr(head);
        hdr.set_message(am_id, payload.len() as u16);

        // SAFETY: dst is the slot's payload area with capacity checked
        // above; the slot is exclusively the producer's until publish().
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), self.payload_ptr(head), payload.len());
        }

        hdr.publish();
        ctl.publish_head(head + 1);
        Ok(())
    }
}

// ============================================================================
// Peer-side producer
// ============================================================================

/// Producer end of a peer's receive FIFO.
///
/// Attaches to the region named by the peer's [`FifoId`] and implements the
/// producer half of the SPSC protocol. Exactly one producer may attach to a
/// given FIFO.
pub struct FifoProducer {
    /// Keeps the peer mapping alive for the view below
    _segment: ShmSegment,
    view: FifoView,
    id: FifoId,
}

impl FifoProducer {
    /// Attach to the FIFO identified by `id`.
    ///
    /// # Errors
    ///
    /// Fails if the identity describes an invalid geometry or the segment
    /// cannot be mapped.
    pub fn attach(id: &FifoId) -> Result<Self> {
        id.validate()?;

        let size = fifo_region_size(id.fifo_size as usize, id.elem_size as usize);
        let segment = ShmSegment::open(&id.name, size)?;
        let view = FifoView::new(
            segment.as_ptr(),
            id.fifo_size as usize,
            id.elem_size as usize,
        );

        Ok(Self {
            _segment: segment,
            view,
            id: id.clone(),
        })
    }

    /// Push one active message into the peer's FIFO.
    ///
    /// # Errors
    ///
    /// [`ShmError::NoResource`] when the ring is full; retry after the
    /// consumer has progressed.
    pub fn push(&mut self, am_id: u8, payload: &[u8]) -> Result<()> {
        self.view.try_push(am_id, payload)
    }

    /// Number of elements written but not yet covered by the published tail
    #[must_use]
    pub fn pending(&self) -> u64 {
        let ctl = self.view.ctl();
        ctl.head().wrapping_sub(ctl.tail())
    }

    /// Identity of the FIFO this producer feeds
    #[must_use]
    pub fn id(&self) -> &FifoId {
        &self.id
    }
}
