use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{debug, trace};
use thiserror::Error;

use crate::memory::access::{fence, flush};
use crate::memory::{PhysAddrResolver, PhysAddr};
use crate::util::CL_SIZE;

/// Errors that can occur while provisioning a [`MemoryRegion`].
#[derive(Debug, Error)]
pub enum RegionError {
    /// mmap failed
    #[error("mmap of {size} bytes failed: {source}")]
    AllocFailed {
        /// Requested size in bytes
        size: usize,
        /// Underlying OS error
        source: std::io::Error,
    },
    /// Attempted to create a zero-size region
    #[error("Zero size region")]
    ZeroSize,
    /// Region size is not a multiple of the page size
    #[error("Region size {size} is not a multiple of page size {page_size}")]
    Unaligned {
        /// Requested size in bytes
        size: usize,
        /// Page size in bytes
        page_size: usize,
    },
}

/// A page-aligned buffer owned by one probing session.
///
/// The buffer is unmapped when the region is dropped. Raw pointers handed out by
/// [`MemoryRegion::addr`] are valid only while the region is alive.
#[derive(Debug)]
pub struct MemoryRegion {
    map_ptr: *mut u8,
    map_len: usize,
    ptr: *mut u8,
    len: usize,
    page_size: usize,
}

// Hammer workers access disjoint addresses; all pattern writes and scans happen
// on the controlling thread between bursts.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Maps `len` bytes of anonymous memory aligned to `page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError`] if the size is invalid or mmap fails.
    pub fn mmap(len: usize, page_size: usize) -> Result<Self, RegionError> {
        if len == 0 || page_size == 0 {
            return Err(RegionError::ZeroSize);
        }
        if !len.is_multiple_of(page_size) {
            return Err(RegionError::Unaligned {
                size: len,
                page_size,
            });
        }
        // over-map by one page so the usable part can be aligned to page_size
        let map_len = len + page_size;
        let p = unsafe {
            libc::mmap(
                null_mut(),
                map_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(RegionError::AllocFailed {
                size: map_len,
                source: std::io::Error::last_os_error(),
            });
        }
        let map_ptr = p as *mut u8;
        let misalignment = map_ptr as usize % page_size;
        let ptr = if misalignment == 0 {
            map_ptr
        } else {
            unsafe { map_ptr.byte_add(page_size - misalignment) }
        };
        debug!(
            "Mapped {} bytes at {:p} (aligned to 0x{:x})",
            len, ptr, page_size
        );
        Ok(MemoryRegion {
            map_ptr,
            map_len,
            ptr,
            len,
            page_size,
        })
    }

    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    pub fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "MemoryRegion::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }

    /// Start of the region.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for a mapped region).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page size the region was aligned to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the region.
    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    /// Pointer to the first byte of page `index`.
    pub fn page_addr(&self, index: usize) -> *mut u8 {
        self.addr(index * self.page_size)
    }

    /// Offset of `ptr` within the region, if it lies inside.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let p = ptr as usize;
        let base = self.ptr as usize;
        if p >= base && p < base + self.len {
            Some(p - base)
        } else {
            None
        }
    }

    /// Writes `pattern` to every byte of the region.
    pub fn fill(&self, pattern: u8) {
        self.fill_range(0, self.len, pattern);
    }

    /// Writes `pattern` to `len` bytes starting at `offset`.
    pub fn fill_range(&self, offset: usize, len: usize, pattern: u8) {
        assert!(offset + len <= self.len, "fill_range out of bounds");
        trace!("fill 0x{:x}..0x{:x} with 0x{:02x}", offset, offset + len, pattern);
        unsafe { std::ptr::write_bytes(self.ptr.byte_add(offset), pattern, len) };
    }

    /// Writes `pattern` once into every page so the kernel backs it with a physical frame.
    pub fn touch_pages(&self, pattern: u8) {
        for page in 0..self.page_count() {
            unsafe { std::ptr::write_volatile(self.page_addr(page), pattern) };
        }
        fence();
        debug!("Touched {} pages", self.page_count());
    }

    /// Evicts every cache line in `offset..offset + len` and fences.
    ///
    /// Subsequent reads are served from DRAM.
    pub fn flush_range(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len, "flush_range out of bounds");
        for line in (offset..offset + len).step_by(CL_SIZE) {
            unsafe { flush(self.ptr.byte_add(line)) };
        }
        fence();
    }

    /// The whole region as a byte slice.
    ///
    /// Must not be held across a hammer burst that writes to the region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// `len` bytes of the region starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.as_slice()[offset..offset + len]
    }

    /// Resolves the physical address of every page, in page order.
    pub fn resolve_pages(&self, resolver: &mut dyn PhysAddrResolver) -> Vec<Option<PhysAddr>> {
        resolver.resolve_pages(self.ptr as usize, self.page_count(), self.page_size)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        debug!("Unmapping region at {:p}", self.ptr);
        unsafe { libc::munmap(self.map_ptr as *mut libc::c_void, self.map_len) };
    }
}
