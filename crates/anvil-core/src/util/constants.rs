/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 64;

/// Default granularity of the per-chunk region state (1 MiB)
pub const CHUNK_SIZE: usize = 1 << 20;

/// Physical addresses below this bound are never targeted (1 GiB).
///
/// Low physical memory is populated by firmware and kernel structures.
pub const PHYS_ADDR_MIN: u64 = 1 << 30;

/// Default number of flush-and-time trials per latency candidate
pub const LATENCY_TRIALS: usize = 10;
