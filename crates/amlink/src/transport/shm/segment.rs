// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for the FIFO
//! regions. The receive side creates a segment; the peer producer opens it
//! by name. Mappings are released on drop; the creator unlinks the name.
//!
//! # Huge pages
//!
//! Segment creation takes a [`HugetlbMode`]: `Never` maps with default
//! pages, `Try` attempts `MAP_HUGETLB` and falls back, `Force` fails if
//! huge pages are unavailable.
//!
//! # Naming
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/amlink_fifo_12345_0`

use super::{HugetlbMode, Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// POSIX shared memory segment wrapper.
///
/// Unmaps the region on drop. Does NOT unlink the name on drop; the
/// creating side is responsible for cleanup.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapped region is shared between processes by design; all
// cross-process access goes through atomics in the FIFO ctl and element
// headers. The pointer itself is stable for the lifetime of the mapping.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment, replacing any stale one with
    /// the same name.
    ///
    /// The region is zero-filled, which doubles as FIFO ctl and element
    /// flag initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, segment creation fails, or
    /// mapping fails (including `Force` hugetlb on a host without huge
    /// pages).
    pub fn create(name: &str, size: usize, hugetlb: HugetlbMode) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink of a
        // missing name is harmless; shm_open with O_CREAT|O_EXCL either
        // yields a fresh fd or -1, checked below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor opened above; ftruncate sets
        // the object's length and reports failure via -1.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still open and unused elsewhere on this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = match Self::map(fd, size, hugetlb) {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: fd is still open; the failed mmap holds no reference.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        // SAFETY: the mapping holds its own reference to the object, so the
        // fd can be closed once mmap succeeded.
        unsafe { libc::close(fd) };

        // SAFETY: ptr..ptr+size is the freshly created private mapping; no
        // peer has attached yet, so the plain write is race-free.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment by name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::NotFound`] if no segment with this name exists,
    /// or a mapping error.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; shm_open without
        // O_CREAT only attaches to an existing object.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // The opener inherits whatever page backing the creator chose, so
        // no hugetlb flag is needed here.
        let ptr = match Self::map(fd, size, HugetlbMode::Never) {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: fd is still open; the failed mmap holds no reference.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        // SAFETY: the mapping holds its own reference to the object.
        unsafe { libc::close(fd) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map `size` bytes of `fd`, honoring the hugetlb mode.
    fn map(fd: libc::c_int, size: usize, hugetlb: HugetlbMode) -> Result<*mut u8> {
        let base_flags = libc::MAP_SHARED;

        if matches!(hugetlb, HugetlbMode::Try | HugetlbMode::Force) {
            // SAFETY: null hint lets the kernel pick the address; fd is a
            // valid shm object descriptor; MAP_FAILED is checked below.
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    base_flags | libc::MAP_HUGETLB,
                    fd,
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                return Ok(ptr as *mut u8);
            }
            let err = io::Error::last_os_error();
            if matches!(hugetlb, HugetlbMode::Force) {
                return Err(ShmError::Mmap(err));
            }
            log::debug!("[SHM] hugetlb mapping failed ({err}), falling back to default pages");
        }

        // SAFETY: as above, with default page backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                base_flags,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Validate segment name follows POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "Segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a shared memory segment by name.
    ///
    /// The object disappears once every process unmaps it; calling this on
    /// a missing name is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink only
        // touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Raw pointer to the mapped region
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a segment with the given name currently exists
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: c_name is valid; a read-only open probes for existence
        // and the fd is closed immediately.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and not used after this point.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe exactly the mapping established in
        // create()/open(); Drop runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // The name is not unlinked here; the creating side owns cleanup.
    }
}

/// Remove leftover segments from crashed processes.
///
/// Scans `/dev/shm` for names carrying this crate's prefix and unlinks
/// them. Call at startup, before any interface is opened; a segment
/// belonging to a live process would be re-created by its owner anyway,
/// but running this concurrently with live interfaces is not supported.
///
/// Returns the number of segments removed.
pub fn cleanup_stale_segments(prefix: &str) -> usize {
    let mut cleaned = 0;

    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }

        let segment_name = format!("/{name}");
        if ShmSegment::unlink(&segment_name).is_ok() {
            log::debug!("[SHM] cleaned up stale segment: {segment_name}");
            cleaned += 1;
        }
    }

    cleaned
}
