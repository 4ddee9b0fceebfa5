//! Cache-line flush, fence and non-elidable memory access.
//!
//! This is the only hardware-specific code in the crate. Everything that
//! touches aggressor or victim memory for measurement purposes goes through
//! these functions.

use std::time::Instant;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_mfence};

/// Evicts the cache line containing `ptr` from every cache level.
///
/// # Safety
///
/// `ptr` must point into mapped memory.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn flush(ptr: *const u8) {
    unsafe { _mm_clflush(ptr) }
}

/// Evicts the cache line containing `ptr` (no-op without a user-level flush instruction).
///
/// # Safety
///
/// `ptr` must point into mapped memory.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub unsafe fn flush(_ptr: *const u8) {}

/// Full memory fence. All earlier loads, stores and flushes complete before later ones start.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn fence() {
    unsafe { _mm_mfence() }
}

/// Full memory fence. All earlier loads and stores complete before later ones start.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn fence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Loads the byte at `ptr` in a way the compiler can neither remove nor hoist.
///
/// # Safety
///
/// `ptr` must be valid for reads.
#[inline(always)]
pub unsafe fn forced_load(ptr: *const u8) -> u8 {
    std::hint::black_box(unsafe { std::ptr::read_volatile(ptr) })
}

/// Stores `value` at `ptr` in a way the compiler can neither remove nor merge.
///
/// # Safety
///
/// `ptr` must be valid for writes and not concurrently written by another thread.
#[inline(always)]
pub unsafe fn forced_store(ptr: *mut u8, value: u8) {
    unsafe { std::ptr::write_volatile(std::hint::black_box(ptr), value) }
}

/// Measures the latency of single memory accesses.
pub trait AccessTimer {
    /// Returns the latency in nanoseconds of one access to `ptr` after its line was flushed.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads.
    unsafe fn access_latency_ns(&self, ptr: *const u8) -> u64;
}

/// Flush, fence, then time a forced load against a monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushReloadTimer;

impl AccessTimer for FlushReloadTimer {
    unsafe fn access_latency_ns(&self, ptr: *const u8) -> u64 {
        unsafe {
            flush(ptr);
            fence();
            let start = Instant::now();
            forced_load(ptr);
            fence();
            start.elapsed().as_nanos() as u64
        }
    }
}
