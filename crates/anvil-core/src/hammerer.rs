//! Rowhammer hammering traits.
//!
//! This module defines the [`Hammering`] trait that all hammering implementations must implement
//! to perform memory access patterns that induce bit flips through the Rowhammer effect.

use serde::{Deserialize, Serialize};

use crate::memory::AggressorPtr;

/// How an aggressor address is accessed during a burst.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// Non-elidable load
    #[default]
    Load,
    /// Non-elidable store of the given byte
    Store(u8),
}

/// The aggressor addresses one worker hammers.
///
/// Sets handed to a single burst must not share addresses written by
/// [`AccessKind::Store`], since workers run without locking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetSet {
    addrs: Vec<AggressorPtr>,
}

// The pointers refer into a MemoryRegion that outlives every burst.
unsafe impl Send for TargetSet {}
unsafe impl Sync for TargetSet {}

impl TargetSet {
    /// Creates a set from aggressor pointers.
    pub fn new(addrs: Vec<AggressorPtr>) -> Self {
        TargetSet { addrs }
    }

    /// Aggressor addresses in access order.
    pub fn addrs(&self) -> &[AggressorPtr] {
        &self.addrs
    }

    /// Number of aggressors.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether the set has no aggressors.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl From<Vec<AggressorPtr>> for TargetSet {
    fn from(addrs: Vec<AggressorPtr>) -> Self {
        TargetSet::new(addrs)
    }
}

/// Trait for implementing Rowhammer hammering techniques.
///
/// Implementors execute bursts of accesses against aggressor addresses to
/// induce bit flips in adjacent DRAM rows. A hammerer never checks for flips
/// itself; the caller analyzes the region after the burst returns.
///
/// # Associated Types
///
/// * `Error` - The error type returned by hammering operations. Must implement [`std::error::Error`].
///
/// # Examples
///
/// See `anvil-flush` and `anvil-dummy` for concrete implementations.
pub trait Hammering {
    /// The error type returned by hammering operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Hammers every set in `sets` for `burst_length` iterations.
    ///
    /// One iteration flushes, accesses and fences each address of a set in
    /// order. The call returns only after every set has finished its burst;
    /// a started burst is never cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the hammerer could not run its workers.
    fn hammer_burst(&self, sets: &[TargetSet], burst_length: u64) -> Result<(), Self::Error>;
}
