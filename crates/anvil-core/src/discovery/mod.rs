//! Target discovery.
//!
//! Two strategies produce hammer targets from a [`MemoryRegion`](crate::memory::MemoryRegion):
//!
//! - [`latency`]: samples random pages and ranks them by post-flush access
//!   latency. The ranking is a heuristic, not a susceptibility guarantee.
//! - [`contiguity`]: resolves every page and keeps physically back-to-back
//!   aggressor/victim/aggressor triplets.
//!
//! Both treat unresolved pages as unusable and never fail on them.
pub mod contiguity;
pub mod latency;

pub use self::contiguity::{
    AggressorVictimTriplet, discover_triplets, find_triplets, non_overlapping_batches,
    resolve_region,
};
pub use self::latency::{
    CandidateTarget, LatencyDiscovery, candidate_pairs, default_pair, rank_by_latency,
};
