//! The `memory` module provides the memory-facing primitives of anvil.
//!
//! - [`MemoryRegion`]: the page-aligned buffer a session probes.
//! - [`PhysAddrResolver`]: capability for translating virtual to physical addresses,
//!   implemented by [`LinuxPageMap`] (`/proc/self/pagemap`) and [`StaticResolver`]
//!   (synthetic table).
//! - [`access`]: cache-line flush, fence and non-elidable access, plus the
//!   [`AccessTimer`] used for latency profiling.
pub mod access;
mod region;
mod virt_to_phys;

pub use self::access::{AccessTimer, FlushReloadTimer};
pub use self::region::{MemoryRegion, RegionError};
pub use self::virt_to_phys::{
    LinuxPageMap, PhysAddr, PhysAddrResolver, ResolveError, StaticResolver,
};

/// Pointer type for aggressor addresses.
pub type AggressorPtr = *const u8;
