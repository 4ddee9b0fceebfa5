use std::sync::atomic::{AtomicU64, Ordering};

use anvil_core::hammerer::{Hammering, TargetSet};
use anvil_core::memory::access::{fence, flush};
use log::debug;
use thiserror::Error;

/// Dummy hammerer that simulates bursts for testing.
///
/// A no-op dummy never writes memory. A corrupting dummy sets `mask` in the byte
/// `distance` bytes after the first aggressor of the first set on every burst;
/// the caller must make sure that byte lies inside the hammered region. Setting
/// bits is idempotent, so repeated bursts leave the same corrupted value.
#[derive(Debug, Default)]
pub struct Dummy {
    corruption: Option<(usize, u8)>,
    bursts: AtomicU64,
}

impl Dummy {
    /// Creates a dummy that never touches memory.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Creates a dummy that sets `mask` at `distance` bytes past the first aggressor.
    pub fn setting_bits(distance: usize, mask: u8) -> Self {
        Dummy {
            corruption: Some((distance, mask)),
            bursts: AtomicU64::new(0),
        }
    }

    /// Number of bursts executed.
    pub fn bursts(&self) -> u64 {
        self.bursts.load(Ordering::Relaxed)
    }
}

/// Error type that can never occur.
#[derive(Debug, Error)]
pub enum Never {}

impl Hammering for Dummy {
    type Error = Never;

    fn hammer_burst(&self, sets: &[TargetSet], burst_length: u64) -> Result<(), Self::Error> {
        self.bursts.fetch_add(1, Ordering::Relaxed);
        let Some((distance, mask)) = self.corruption else {
            return Ok(());
        };
        let Some(&first) = sets.first().and_then(|set| set.addrs().first()) else {
            return Ok(());
        };
        let target = first.wrapping_add(distance) as *mut u8;
        unsafe {
            let old = std::ptr::read_volatile(target);
            debug!(
                "Burst of {}: set 0x{:02x} at {:p} (0x{:02x} -> 0x{:02x})",
                burst_length,
                mask,
                target,
                old,
                old | mask
            );
            std::ptr::write_volatile(target, old | mask);
            flush(target);
        }
        fence();
        Ok(())
    }
}
