use std::collections::HashSet;

use indicatif::MultiProgress;
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;

use crate::memory::{AccessTimer, AggressorPtr, MemoryRegion, PhysAddr, PhysAddrResolver};
use crate::util::named_bar;

/// Samples drawn per requested candidate (or per page, whichever is larger) before giving up.
const SAMPLE_BUDGET_FACTOR: usize = 4;

/// A sampled page with its mean post-flush access latency.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct CandidateTarget {
    /// Virtual address of the sampled page
    pub address: usize,
    /// Mean access latency after a cache-line flush
    pub measured_latency_ns: u64,
    /// Physical address at sampling time
    pub physical_address: PhysAddr,
}

impl CandidateTarget {
    /// The candidate address as an aggressor pointer.
    pub fn ptr(&self) -> AggressorPtr {
        self.address as AggressorPtr
    }
}

/// Parameters for latency-ranked candidate discovery.
#[derive(Clone, Copy, Debug)]
pub struct LatencyDiscovery {
    /// Number of candidates to collect
    pub candidate_count: usize,
    /// Flush-and-time trials averaged per candidate
    pub trials: usize,
    /// Pages below this physical address are discarded
    pub min_phys_addr: u64,
}

impl LatencyDiscovery {
    /// Samples random pages of `region` until `candidate_count` valid candidates are found.
    ///
    /// A sample is valid if it resolves to a physical address at or above
    /// `min_phys_addr`. Each page is sampled at most once, and sampling stops
    /// after a bounded number of draws, so a region whose pages never resolve
    /// yields an empty result instead of spinning.
    ///
    /// The result is ordered by descending latency (see [`rank_by_latency`]).
    pub fn discover(
        &self,
        region: &MemoryRegion,
        resolver: &mut dyn PhysAddrResolver,
        timer: &dyn AccessTimer,
        rng: &mut impl Rng,
        progress: Option<&MultiProgress>,
    ) -> Vec<CandidateTarget> {
        let pages = region.page_count();
        let budget = SAMPLE_BUDGET_FACTOR * self.candidate_count.max(pages);
        let trials = self.trials.max(1);
        let bar = named_bar(progress, "Latency candidates", self.candidate_count as u64);

        let mut sampled = HashSet::new();
        let mut candidates = Vec::with_capacity(self.candidate_count);
        let mut unresolved = 0usize;
        for _ in 0..budget {
            if candidates.len() >= self.candidate_count || sampled.len() >= pages {
                break;
            }
            let page = rng.random_range(0..pages);
            if !sampled.insert(page) {
                continue;
            }
            let ptr = region.page_addr(page);
            let phys = match resolver.resolve(ptr as usize) {
                Ok(phys) if phys.as_u64() >= self.min_phys_addr => phys,
                Ok(phys) => {
                    debug!("skip page {}: {:?} below threshold", page, phys);
                    continue;
                }
                Err(e) => {
                    debug!("skip page {}: {}", page, e);
                    unresolved += 1;
                    continue;
                }
            };
            let total: u64 = (0..trials)
                .map(|_| unsafe { timer.access_latency_ns(ptr) })
                .sum();
            candidates.push(CandidateTarget {
                address: ptr as usize,
                measured_latency_ns: total / trials as u64,
                physical_address: phys,
            });
            if let Some(bar) = &bar {
                bar.set_position(candidates.len() as u64);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        if candidates.len() < self.candidate_count {
            warn!(
                "Collected {}/{} latency candidates ({} of {} sampled pages unresolved)",
                candidates.len(),
                self.candidate_count,
                unresolved,
                sampled.len()
            );
        } else {
            info!("Collected {} latency candidates", candidates.len());
        }
        rank_by_latency(candidates)
    }
}

/// Sorts candidates by descending latency; ties keep their sampling order.
///
/// Higher latency after a flush is taken as a hint of a row-buffer conflict in
/// the same bank, which is where disturbance is more likely. This is a selection
/// heuristic only: it has no demonstrated correlation with actual flip
/// susceptibility.
pub fn rank_by_latency(mut candidates: Vec<CandidateTarget>) -> Vec<CandidateTarget> {
    candidates.sort_by(|a, b| b.measured_latency_ns.cmp(&a.measured_latency_ns));
    candidates
}

/// The two slowest candidates, used as the default hammer pair.
pub fn default_pair(ranked: &[CandidateTarget]) -> Option<(CandidateTarget, CandidateTarget)> {
    match ranked {
        [first, second, ..] => Some((*first, *second)),
        _ => None,
    }
}

/// Splits ranked candidates into consecutive pairs, at most `limit` of them.
///
/// The first pair is always the [`default_pair`]. A leftover odd candidate is dropped.
pub fn candidate_pairs(
    ranked: &[CandidateTarget],
    limit: usize,
) -> Vec<(CandidateTarget, CandidateTarget)> {
    ranked
        .iter()
        .copied()
        .tuples()
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StaticResolver;
    use crate::util::{PAGE_SIZE, Rng as SeededRng};
    use std::collections::HashMap;

    fn candidate(address: usize, latency: u64) -> CandidateTarget {
        CandidateTarget {
            address,
            measured_latency_ns: latency,
            physical_address: PhysAddr::new(0x4000_0000 + address as u64),
        }
    }

    /// Latency keyed by page address; unknown pages take 1 ns.
    struct TableTimer(HashMap<usize, u64>);

    impl AccessTimer for TableTimer {
        unsafe fn access_latency_ns(&self, ptr: *const u8) -> u64 {
            *self.0.get(&(ptr as usize)).unwrap_or(&1)
        }
    }

    #[test]
    fn test_rank_by_latency() {
        let ranked = rank_by_latency(vec![
            candidate(0, 5),
            candidate(1, 1),
            candidate(2, 9),
            candidate(3, 3),
        ]);
        let latencies = ranked
            .iter()
            .map(|c| c.measured_latency_ns)
            .collect::<Vec<_>>();
        assert_eq!(latencies, vec![9, 5, 3, 1]);
    }

    #[test]
    fn test_rank_is_stable() {
        let ranked = rank_by_latency(vec![candidate(0, 4), candidate(1, 4), candidate(2, 7)]);
        let addrs = ranked.iter().map(|c| c.address).collect::<Vec<_>>();
        assert_eq!(addrs, vec![2, 0, 1]);
    }

    #[test]
    fn test_default_pair_and_sets() {
        let ranked = rank_by_latency(vec![
            candidate(0x1000, 5),
            candidate(0x2000, 1),
            candidate(0x3000, 9),
            candidate(0x4000, 3),
            candidate(0x5000, 2),
        ]);
        let (a, b) = default_pair(&ranked).unwrap();
        assert_eq!((a.address, b.address), (0x3000, 0x1000));
        let pairs = candidate_pairs(&ranked, 4);
        assert_eq!(pairs.len(), 2);
        assert_eq!((pairs[0].0.address, pairs[0].1.address), (0x3000, 0x1000));
        assert_eq!((pairs[1].0.address, pairs[1].1.address), (0x4000, 0x5000));
        assert_eq!(candidate_pairs(&ranked, 1).len(), 1);
        assert!(default_pair(&ranked[..1]).is_none());
    }

    #[test]
    fn test_discover_ranks_synthetic_latencies() -> anyhow::Result<()> {
        let region = MemoryRegion::mmap(4 * PAGE_SIZE, PAGE_SIZE)?;
        let base = region.ptr() as usize;
        let phys = (0..4)
            .map(|i| PhysAddr::new(0x4000_0000 + (i * PAGE_SIZE) as u64))
            .collect::<Vec<_>>();
        let mut resolver = StaticResolver::from_pages(base, PAGE_SIZE, &phys);
        let timer = TableTimer(
            [5, 1, 9, 3]
                .into_iter()
                .enumerate()
                .map(|(i, l)| (base + i * PAGE_SIZE, l))
                .collect(),
        );
        let discovery = LatencyDiscovery {
            candidate_count: 4,
            trials: 3,
            min_phys_addr: 1 << 30,
        };
        let mut rng = SeededRng::from_seed(1);
        let found = discovery.discover(&region, &mut resolver, &timer, &mut rng, None);
        let latencies = found
            .iter()
            .map(|c| c.measured_latency_ns)
            .collect::<Vec<_>>();
        assert_eq!(latencies, vec![9, 5, 3, 1]);
        Ok(())
    }

    #[test]
    fn test_discover_all_unresolved_is_empty() -> anyhow::Result<()> {
        let region = MemoryRegion::mmap(8 * PAGE_SIZE, PAGE_SIZE)?;
        let mut resolver = StaticResolver::new(PAGE_SIZE);
        let discovery = LatencyDiscovery {
            candidate_count: 4,
            trials: 1,
            min_phys_addr: 0,
        };
        let mut rng = SeededRng::from_seed(2);
        let found = discovery.discover(
            &region,
            &mut resolver,
            &TableTimer(HashMap::new()),
            &mut rng,
            None,
        );
        assert!(found.is_empty());
        Ok(())
    }

    #[test]
    fn test_discover_skips_low_physical_pages() -> anyhow::Result<()> {
        let region = MemoryRegion::mmap(4 * PAGE_SIZE, PAGE_SIZE)?;
        let base = region.ptr() as usize;
        let phys = [0x1000u64, 0x4000_0000, 0x2000, 0x4000_2000].map(PhysAddr::new);
        let mut resolver = StaticResolver::from_pages(base, PAGE_SIZE, &phys);
        let discovery = LatencyDiscovery {
            candidate_count: 4,
            trials: 1,
            min_phys_addr: 1 << 30,
        };
        let mut rng = SeededRng::from_seed(3);
        let found = discovery.discover(
            &region,
            &mut resolver,
            &TableTimer(HashMap::new()),
            &mut rng,
            None,
        );
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.physical_address.as_u64() >= 1 << 30));
        Ok(())
    }
}
