use std::collections::HashSet;

use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

use crate::memory::{MemoryRegion, PhysAddr, PhysAddrResolver};

/// Three physically back-to-back pages: aggressor, victim, aggressor.
///
/// Indices are page offsets into the region.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct AggressorVictimTriplet {
    /// Lower aggressor page
    pub aggressor1_index: usize,
    /// Victim page between the aggressors
    pub victim_index: usize,
    /// Upper aggressor page
    pub aggressor2_index: usize,
    /// Victim flips observed while scanning this triplet
    pub flip_count: usize,
}

impl AggressorVictimTriplet {
    /// Triplet starting at page `first`.
    pub fn starting_at(first: usize) -> Self {
        AggressorVictimTriplet {
            aggressor1_index: first,
            victim_index: first + 1,
            aggressor2_index: first + 2,
            flip_count: 0,
        }
    }

    /// All three page indices in ascending order.
    pub fn pages(&self) -> [usize; 3] {
        [self.aggressor1_index, self.victim_index, self.aggressor2_index]
    }

    /// Both aggressor page indices.
    pub fn aggressors(&self) -> [usize; 2] {
        [self.aggressor1_index, self.aggressor2_index]
    }
}

/// Physical address of every page of `region`, in page order.
pub fn resolve_region(
    region: &MemoryRegion,
    resolver: &mut dyn PhysAddrResolver,
) -> Vec<Option<PhysAddr>> {
    let phys = region.resolve_pages(resolver);
    let resolved = phys.iter().flatten().count();
    info!("Resolved {}/{} pages", resolved, phys.len());
    phys
}

/// Scans adjacent page triples for physically contiguous, ascending runs.
///
/// A triple `(i, i+1, i+2)` is emitted iff all three pages are resolved, lie at
/// or above `min_phys_addr`, and each page starts exactly `page_size` bytes after
/// the previous one. An empty result is a valid outcome.
pub fn find_triplets(
    phys: &[Option<PhysAddr>],
    page_size: usize,
    min_phys_addr: u64,
) -> Vec<AggressorVictimTriplet> {
    let usable = |p: &Option<PhysAddr>| (*p).filter(|p| p.as_u64() >= min_phys_addr);
    phys.iter()
        .map(usable)
        .enumerate()
        .tuple_windows()
        .filter_map(|((i, a), (_, v), (_, b))| match (a, v, b) {
            (Some(a), Some(v), Some(b)) if v == a + page_size && b == v + page_size => {
                debug!("Triplet at page {}: {:?} {:?} {:?}", i, a, v, b);
                Some(AggressorVictimTriplet::starting_at(i))
            }
            _ => None,
        })
        .collect()
}

/// Resolves `region` and returns all contiguous triplets in it.
pub fn discover_triplets(
    region: &MemoryRegion,
    resolver: &mut dyn PhysAddrResolver,
    min_phys_addr: u64,
) -> Vec<AggressorVictimTriplet> {
    let phys = resolve_region(region, resolver);
    let triplets = find_triplets(&phys, region.page_size(), min_phys_addr);
    info!(
        "Found {} contiguous triplets above {:#x}",
        triplets.len(),
        min_phys_addr
    );
    triplets
}

/// Groups triplets into batches of at most `width` in which no page appears twice.
///
/// Triplets keep their relative order; each triplet lands in the first batch
/// with room that does not already use one of its pages.
pub fn non_overlapping_batches(
    triplets: &[AggressorVictimTriplet],
    width: usize,
) -> Vec<Vec<AggressorVictimTriplet>> {
    let width = width.max(1);
    let mut batches: Vec<(Vec<AggressorVictimTriplet>, HashSet<usize>)> = vec![];
    for triplet in triplets {
        let pages = triplet.pages();
        let slot = batches.iter_mut().find(|(batch, used)| {
            batch.len() < width && pages.iter().all(|p| !used.contains(p))
        });
        match slot {
            Some((batch, used)) => {
                batch.push(*triplet);
                used.extend(pages);
            }
            None => batches.push((vec![*triplet], pages.into_iter().collect())),
        }
    }
    batches.into_iter().map(|(batch, _)| batch).collect()
}
