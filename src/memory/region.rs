//! Growable address-space region.
//!
//! A `MemoryRegion` reserves a large virtual range up front with no access
//! rights and no physical backing, then commits a prefix of it on demand by
//! granting read/write access to the newly covered pages. Growth never moves
//! or copies: pointers into the committed prefix stay valid for the lifetime
//! of the region.
//!
//! ```text
//! base                      committed               capacity
//!  │◄──── read/write ────────►│◄──── PROT_NONE ────────►│
//! ```

use crate::error::{Result, StageflowError};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Sanity ceiling for a single reservation.
#[cfg(target_pointer_width = "64")]
pub const MAX_REGION_SIZE: usize = 1 << 40;

/// Sanity ceiling for a single reservation.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_REGION_SIZE: usize = 1 << 30;

/// Platform page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

#[inline]
fn round_up(value: usize, granularity: usize) -> Option<usize> {
    debug_assert!(granularity.is_power_of_two());
    value
        .checked_add(granularity - 1)
        .map(|v| v & !(granularity - 1))
}

/// A reserved address range with a monotonically growing committed prefix.
pub struct MemoryRegion {
    base: NonNull<u8>,
    /// Reserved bytes, a multiple of the page size and of the alignment.
    capacity: usize,
    /// Logical committed size `S`. Only grows.
    committed: usize,
    /// Page-rounded extent that currently has read/write access.
    protected: usize,
}

// The region exclusively owns its mapping. Growth requires `&mut self`, so
// there is never more than one committer.
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    /// Reserve `max_size` bytes of address space aligned to `alignment`.
    ///
    /// The size is rounded up to the page size (or the alignment, if larger).
    /// Nothing is committed; touching the range before `commit` faults.
    pub fn reserve(max_size: usize, alignment: usize) -> Result<Self> {
        let page = page_size();

        if !alignment.is_power_of_two() {
            return Err(StageflowError::invalid(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if max_size < page {
            return Err(StageflowError::invalid(format!(
                "reservation of {max_size} bytes is below one page ({page})"
            )));
        }
        if max_size > MAX_REGION_SIZE || alignment > MAX_REGION_SIZE {
            return Err(StageflowError::TooLarge {
                requested: max_size.max(alignment),
                limit: MAX_REGION_SIZE,
            });
        }

        let granularity = alignment.max(page);
        let capacity = round_up(max_size, granularity).ok_or(StageflowError::TooLarge {
            requested: max_size,
            limit: MAX_REGION_SIZE,
        })?;

        // Over-reserve by one granule when the alignment exceeds what mmap
        // guarantees, then trim both ends.
        let over = if granularity > page {
            capacity + granularity
        } else {
            capacity
        };

        let raw = sys::reserve(over)?;
        let addr = raw.as_ptr() as usize;
        let aligned = round_up(addr, granularity).ok_or_else(|| StageflowError::OutOfMemory {
            requested: over,
            cause: "reservation wrapped the address space".to_string(),
        })?;

        let head = aligned - addr;
        let tail = over - head - capacity;
        if head > 0 {
            sys::release(raw.as_ptr(), head);
        }
        if tail > 0 {
            sys::release((aligned + capacity) as *mut u8, tail);
        }

        let base = NonNull::new(aligned as *mut u8).ok_or_else(|| StageflowError::OutOfMemory {
            requested: over,
            cause: "null reservation".to_string(),
        })?;

        tracing::trace!(capacity, alignment = granularity, "reserved region");

        Ok(Self {
            base,
            capacity,
            committed: 0,
            protected: 0,
        })
    }

    /// Grow the committed prefix to `new_size` bytes.
    ///
    /// Only the newly covered pages change protection; committed bytes are
    /// left untouched. Shrinking is rejected.
    pub fn commit(&mut self, new_size: usize) -> Result<()> {
        if new_size < self.committed {
            return Err(StageflowError::invalid(format!(
                "commit would shrink region from {} to {new_size} bytes",
                self.committed
            )));
        }
        if new_size > self.capacity {
            return Err(StageflowError::ResourceExhausted(format!(
                "commit of {new_size} bytes exceeds reservation of {} bytes",
                self.capacity
            )));
        }
        if new_size == self.committed {
            return Ok(());
        }

        // capacity is a page multiple, so this never exceeds it
        let target = round_up(new_size, page_size()).unwrap_or(self.capacity);
        if target > self.protected {
            // SAFETY: [protected, target) lies inside our reservation.
            let start = unsafe { self.base.as_ptr().add(self.protected) };
            sys::commit(start, target - self.protected)?;
            self.protected = target;
        }
        self.committed = new_size;
        Ok(())
    }

    /// Make sure at least `min_size` bytes are committed.
    ///
    /// The committed size doubles (starting from one page) until it covers
    /// `min_size`. If doubling would overshoot the reservation, exactly
    /// `min_size` is committed instead.
    pub fn ensure_capacity(&mut self, min_size: usize) -> Result<()> {
        if min_size <= self.committed {
            return Ok(());
        }
        if min_size > self.capacity {
            return Err(StageflowError::ResourceExhausted(format!(
                "requested {min_size} bytes but the reservation ceiling is {} bytes",
                self.capacity
            )));
        }

        let mut size = self.committed.max(page_size());
        while size < min_size {
            size = size.saturating_mul(2);
        }
        if size > self.capacity {
            size = min_size;
        }
        self.commit(size)
    }

    /// Unmap the entire reservation. Equivalent to dropping the region.
    pub fn release(self) {
        drop(self);
    }

    /// Reserved size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed size in bytes.
    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Start of the reservation.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Start of the reservation, for writes into the committed prefix.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Raw base pointer without borrowing the region mutably. Callers that
    /// write through it must own the addressed bytes exclusively.
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The committed prefix.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [0, committed) is mapped read/write and owned by self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.committed) }
    }

    /// The committed prefix, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.committed) }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        sys::release(self.base.as_ptr(), self.capacity);
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("committed", &self.committed)
            .finish()
    }
}

#[cfg(unix)]
mod sys {
    use crate::error::{Result, StageflowError};
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    pub fn reserve(len: usize) -> Result<NonNull<u8>> {
        // SAFETY: anonymous mapping with no fixed address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(StageflowError::OutOfMemory {
                requested: len,
                cause: std::io::Error::last_os_error().to_string(),
            });
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| StageflowError::OutOfMemory {
            requested: len,
            cause: "mmap returned null".to_string(),
        })
    }

    pub fn commit(ptr: *mut u8, len: usize) -> Result<()> {
        // SAFETY: caller passes a page-aligned range inside a live reservation.
        let rc = unsafe {
            libc::mprotect(
                ptr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(StageflowError::OutOfMemory {
                requested: len,
                cause: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    pub fn release(ptr: *mut u8, len: usize) {
        // SAFETY: caller passes a range it reserved and no longer uses.
        let rc = unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
        if rc != 0 {
            tracing::warn!(
                "munmap of {} bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use crate::error::{Result, StageflowError};
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        4096
    }

    pub fn reserve(_len: usize) -> Result<NonNull<u8>> {
        Err(StageflowError::Unsupported(
            "address-space reservation requires a unix platform".to_string(),
        ))
    }

    pub fn commit(_ptr: *mut u8, _len: usize) -> Result<()> {
        Err(StageflowError::Unsupported(
            "address-space reservation requires a unix platform".to_string(),
        ))
    }

    pub fn release(_ptr: *mut u8, _len: usize) {}
}
