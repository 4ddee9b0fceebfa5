use std::thread::ScopedJoinHandle;

use log::{debug, trace, warn};
use thiserror::Error;

use anvil_core::hammerer::{AccessKind, Hammering, TargetSet};
use anvil_core::memory::access::{fence, flush, forced_load, forced_store};
use anvil_core::util::pin_current_thread;

/// Errors that can occur during a flush burst.
#[derive(Debug, Error)]
pub enum FlushError {
    /// A worker thread panicked before finishing its burst
    #[error("hammer worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Hammerer that flushes and re-accesses aggressors from parallel workers.
///
/// Target sets are assigned to workers round-robin; a worker with more than
/// one set hammers them one after another. Workers are joined before
/// [`hammer_burst`](Hammering::hammer_burst) returns.
#[derive(Clone, Copy, Debug)]
pub struct FlushHammerer {
    threads: usize,
    pin_threads: bool,
    access: AccessKind,
}

impl FlushHammerer {
    /// Creates a hammerer with `threads` workers (at least one).
    ///
    /// # Arguments
    ///
    /// * `threads` - Maximum number of concurrent workers
    /// * `pin_threads` - Pin worker `i` to core `i % online_cpus` (best effort)
    /// * `access` - Access issued on every aggressor after its flush
    pub fn new(threads: usize, pin_threads: bool, access: AccessKind) -> Self {
        FlushHammerer {
            threads: threads.max(1),
            pin_threads,
            access,
        }
    }

    /// Number of workers.
    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Runs `burst_length` iterations of flush, access and fence over every address of `set`.
fn hammer_set(set: &TargetSet, burst_length: u64, access: AccessKind) {
    for _ in 0..burst_length {
        for &addr in set.addrs() {
            unsafe {
                flush(addr);
                match access {
                    AccessKind::Load => {
                        forced_load(addr);
                    }
                    AccessKind::Store(value) => forced_store(addr as *mut u8, value),
                }
            }
            fence();
        }
    }
}

/// Joins every worker, then reports the first one that panicked.
fn join_workers(handles: Vec<ScopedJoinHandle<'_, ()>>) -> Result<(), FlushError> {
    let panicked = handles
        .into_iter()
        .enumerate()
        .filter_map(|(worker, handle)| handle.join().err().map(|_| worker))
        .collect::<Vec<_>>();
    match panicked.as_slice() {
        [] => Ok(()),
        [first, rest @ ..] => {
            if !rest.is_empty() {
                warn!("Workers {:?} panicked as well", rest);
            }
            Err(FlushError::WorkerPanicked(*first))
        }
    }
}

impl Hammering for FlushHammerer {
    type Error = FlushError;

    fn hammer_burst(&self, sets: &[TargetSet], burst_length: u64) -> Result<(), Self::Error> {
        let workers = self.threads.min(sets.len());
        if workers == 0 {
            return Ok(());
        }
        trace!(
            "Burst of {} over {} sets on {} workers",
            burst_length,
            sets.len(),
            workers
        );
        std::thread::scope(|s| {
            let handles = (0..workers)
                .map(|worker| {
                    let assigned = sets.iter().skip(worker).step_by(workers).collect::<Vec<_>>();
                    let pin = self.pin_threads;
                    let access = self.access;
                    s.spawn(move || {
                        if pin {
                            match pin_current_thread(worker) {
                                Ok(core) => debug!("Worker {} pinned to core {}", worker, core),
                                Err(e) => warn!("Worker {} runs unpinned: {}", worker, e),
                            }
                        }
                        for set in assigned {
                            hammer_set(set, burst_length, access);
                        }
                    })
                })
                .collect::<Vec<_>>();
            join_workers(handles)
        })
    }
}
