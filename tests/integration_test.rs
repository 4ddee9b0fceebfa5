use std::sync::{Arc, Mutex};

use anvil::config::Discovery;
use anvil::hammerer::{AccessKind, Hammering, TargetSet};
use anvil::memory::{AccessTimer, MemoryRegion, PhysAddr, StaticResolver};
use anvil::sink::{EventSink, LogRecord, SinkError};
use anvil::util::PAGE_SIZE;
use anvil::{MemorySink, Mode, Outcome, Session, SessionConfig, SessionError};
use anvil_dummy::Dummy;
use anvil_flush::FlushHammerer;

const PAGES: usize = 16;
const PHYS_BASE: u64 = 0x4000_0000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config(mode: Mode) -> SessionConfig {
    SessionConfig {
        mode,
        region_size: PAGES * PAGE_SIZE,
        page_size: PAGE_SIZE,
        chunk_size: 4 * PAGE_SIZE,
        burst_length: 10,
        cooldown_us: 0,
        round_budget: 12,
        threads: 2,
        pin_threads: false,
        min_phys_addr: PHYS_BASE,
        max_pacing_delay_us: 500,
        candidate_count: 8,
        latency_trials: 2,
        seed: Some(42),
        ..SessionConfig::default()
    }
}

/// Maps the region onto physically back-to-back frames starting at `base`.
fn contiguous(base: u64) -> impl FnOnce(&MemoryRegion) -> StaticResolver {
    move |region| {
        let phys = (0..region.page_count())
            .map(|i| PhysAddr::new(base + (i * PAGE_SIZE) as u64))
            .collect::<Vec<_>>();
        StaticResolver::from_pages(region.ptr() as usize, PAGE_SIZE, &phys)
    }
}

/// Latency grows with the page index.
struct RampTimer;

impl AccessTimer for RampTimer {
    unsafe fn access_latency_ns(&self, ptr: *const u8) -> u64 {
        100 + (ptr as usize / PAGE_SIZE % 1024) as u64
    }
}

/// Remembers the first aggressor of every burst.
#[derive(Clone, Default)]
struct BurstLog(Arc<Mutex<Vec<usize>>>);

impl Hammering for BurstLog {
    type Error = std::convert::Infallible;

    fn hammer_burst(&self, sets: &[TargetSet], _burst_length: u64) -> Result<(), Self::Error> {
        if let Some(&first) = sets.first().and_then(|set| set.addrs().first()) {
            self.0.lock().unwrap().push(first as usize);
        }
        Ok(())
    }
}

struct FailingSink;

impl EventSink for FailingSink {
    fn record(&mut self, _record: &LogRecord) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::other("disk full")))
    }
}

#[test]
fn test_triplet_session_clean() -> anyhow::Result<()> {
    init_logging();
    let mut session = Session::builder(small_config(Mode::Triplet), Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert_eq!(report.outcome, Outcome::Clean);
    assert!(report.flips.is_empty());
    assert_eq!(report.final_entropy, 0.0);
    assert_eq!(report.targets, PAGES - 2);
    assert!(report.best_triplet.is_none());
    assert!(report.rounds > 0);

    let sink = session.into_sink();
    assert_eq!(sink.of_type("FLIP").count(), 0);
    assert_eq!(sink.of_type("TRIPLET").count(), PAGES - 2);
    assert_eq!(sink.of_type("ENTROPY").count(), 1);
    Ok(())
}

#[test]
fn test_triplet_session_detects_victim_flips() -> anyhow::Result<()> {
    init_logging();
    let dummy = Dummy::setting_bits(PAGE_SIZE, 0x01);
    let mut session = Session::builder(small_config(Mode::Triplet), dummy, MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert!(matches!(report.outcome, Outcome::FlipsDetected(n) if n > 0));
    let best = report.best_triplet.expect("a triplet with victim flips");
    assert_eq!(best.flip_count, 1);
    let Outcome::FlipsDetected(distinct) = report.outcome else {
        unreachable!()
    };
    assert_eq!(report.transitions.zero_to_one as usize, distinct);
    assert_eq!(report.transitions.one_to_zero, 0);

    let sink = session.into_sink();
    let flips = sink
        .of_type("FLIP")
        .filter_map(|r| match r {
            LogRecord::Flip(flip) => Some(flip),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(!flips.is_empty());
    for flip in flips {
        assert_eq!(flip.expected, 0xAA);
        assert_eq!(flip.actual, 0xAB);
        assert_eq!(flip.delta_bits, 1);
        assert_eq!(flip.offset % PAGE_SIZE, 0);
    }
    Ok(())
}

#[test]
fn test_triplet_scan_limited_by_round_budget() -> anyhow::Result<()> {
    init_logging();
    let mut config = small_config(Mode::Triplet);
    config.round_budget = 2;
    let mut session = Session::builder(config, Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert_eq!(report.rounds, 2);
    assert_eq!(report.targets, PAGES - 2);
    // two batches of two disjoint triplets each
    assert_eq!(session.into_sink().of_type("TRIPLET").count(), 4);
    Ok(())
}

#[test]
fn test_triplet_session_without_contiguous_pages() -> anyhow::Result<()> {
    init_logging();
    let mut config = small_config(Mode::Triplet);
    config.min_phys_addr = PHYS_BASE * 4;
    let mut session = Session::builder(config, Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    assert!(matches!(
        session.run(),
        Err(SessionError::NoCandidatesFound(_))
    ));
    Ok(())
}

#[test]
fn test_triplet_session_with_unresolvable_pages() -> anyhow::Result<()> {
    init_logging();
    let mut session = Session::builder(small_config(Mode::Triplet), Dummy::noop(), MemorySink::new())
        .resolver(StaticResolver::new(PAGE_SIZE))
        .build()?;
    assert!(matches!(
        session.run(),
        Err(SessionError::NoCandidatesFound(_))
    ));
    Ok(())
}

#[test]
fn test_adaptive_session_clean() -> anyhow::Result<()> {
    init_logging();
    let config = small_config(Mode::Adaptive);
    let chunks = config.chunk_count();
    let budget = config.round_budget;
    let dummy = Dummy::noop();
    let mut session = Session::builder(config, dummy, MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert_eq!(report.outcome, Outcome::Clean);
    assert_eq!(report.rounds, budget);

    let sink = session.into_sink();
    assert_eq!(sink.of_type("REGION").count(), chunks * budget as usize);
    // one per sampling point plus the final pass
    assert_eq!(sink.of_type("ENTROPY").count(), budget as usize + 1);
    assert_eq!(sink.of_type("FLIP").count(), 0);
    for record in sink.of_type("REGION") {
        if let LogRecord::Region {
            chunk,
            entropy,
            flip_count,
            ..
        } = record
        {
            assert!(*chunk < chunks);
            assert_eq!(*entropy, 0.0);
            assert_eq!(*flip_count, 0);
        }
    }
    Ok(())
}

#[test]
fn test_adaptive_session_slides_across_chunks() -> anyhow::Result<()> {
    init_logging();
    let config = small_config(Mode::Adaptive);
    let chunks = config.chunk_count();
    let chunk_pages = config.chunk_size / PAGE_SIZE;
    let budget = config.round_budget as usize;
    let log = BurstLog::default();
    let mut session = Session::builder(config, log.clone(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let base = session.context().region().ptr() as usize;
    session.run()?;

    // the victim sits one page above the first aggressor
    let victim_chunks = log
        .0
        .lock()
        .unwrap()
        .iter()
        .map(|&addr| ((addr - base) / PAGE_SIZE + 1) / chunk_pages)
        .collect::<Vec<_>>();
    let expected = (0..budget).map(|round| round % chunks).collect::<Vec<_>>();
    assert_eq!(victim_chunks, expected);
    Ok(())
}

#[test]
fn test_adaptive_session_detects_flips() -> anyhow::Result<()> {
    init_logging();
    let dummy = Dummy::setting_bits(PAGE_SIZE, 0x04);
    let mut session = Session::builder(small_config(Mode::Adaptive), dummy, MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert!(matches!(report.outcome, Outcome::FlipsDetected(n) if n > 0));
    assert!(!report.flips.is_empty());
    assert!(report.final_entropy > 0.0);

    let sink = session.into_sink();
    assert!(sink.of_type("REGION").any(|r| matches!(
        r,
        LogRecord::Region { flip_count, .. } if *flip_count > 0
    )));
    let flip_rows = sink.of_type("FLIP").count();
    assert_eq!(Outcome::FlipsDetected(flip_rows), report.outcome);
    Ok(())
}

#[test]
fn test_adaptive_session_with_latency_discovery() -> anyhow::Result<()> {
    init_logging();
    let mut config = small_config(Mode::Adaptive);
    config.discovery = Discovery::Latency;
    let mut session = Session::builder(config, Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .timer(RampTimer)
        .build()?;
    let report = session.run()?;
    assert_eq!(report.outcome, Outcome::Clean);
    assert_eq!(report.targets, 8);
    Ok(())
}

#[test]
fn test_latency_session_runs_round_budget() -> anyhow::Result<()> {
    init_logging();
    let config = small_config(Mode::Latency);
    let budget = config.round_budget;
    let mut session = Session::builder(config, Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .timer(RampTimer)
        .build()?;
    let report = session.run()?;
    assert_eq!(report.outcome, Outcome::Clean);
    assert_eq!(report.rounds, budget);
    assert_eq!(report.targets, 8);
    Ok(())
}

#[test]
fn test_latency_session_below_threshold() -> anyhow::Result<()> {
    init_logging();
    let mut session = Session::builder(small_config(Mode::Latency), Dummy::noop(), MemorySink::new())
        .resolver_with(contiguous(0x1000))
        .timer(RampTimer)
        .build()?;
    assert!(matches!(
        session.run(),
        Err(SessionError::NoCandidatesFound(_))
    ));
    Ok(())
}

#[test]
fn test_failing_sink_does_not_stop_session() -> anyhow::Result<()> {
    init_logging();
    let dummy = Dummy::setting_bits(PAGE_SIZE, 0x01);
    let mut session = Session::builder(small_config(Mode::Triplet), dummy, FailingSink)
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    assert!(matches!(report.outcome, Outcome::FlipsDetected(_)));
    assert!(report.sink_error.is_some_and(|e| e.contains("disk full")));
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = small_config(Mode::Adaptive);
    config.chunk_size = 3 * PAGE_SIZE;
    let result = Session::builder(config, Dummy::noop(), MemorySink::new()).build();
    assert!(matches!(result, Err(SessionError::Config(_))));
}

#[test]
fn test_flush_hammerer_session_stays_clean() -> anyhow::Result<()> {
    init_logging();
    let mut config = small_config(Mode::Triplet);
    config.access = AccessKind::Store(config.pattern);
    let hammerer = FlushHammerer::new(config.threads, false, config.access);
    let mut session = Session::builder(config, hammerer, MemorySink::new())
        .resolver_with(contiguous(PHYS_BASE))
        .build()?;
    let report = session.run()?;
    // a short burst on pattern-preserving stores cannot corrupt anything
    assert_eq!(report.outcome, Outcome::Clean);
    Ok(())
}

#[test]
#[ignore = "requires root for /proc/self/pagemap and hammers real DRAM"]
fn test_pagemap_triplet_session() -> anyhow::Result<()> {
    init_logging();
    let config = SessionConfig {
        mode: Mode::Triplet,
        round_budget: 10,
        pin_threads: false,
        ..SessionConfig::default()
    };
    let hammerer = FlushHammerer::new(config.threads, false, config.access);
    let mut session = Session::builder(config, hammerer, MemorySink::new()).build()?;
    match session.run() {
        Ok(report) => assert!(report.rounds <= 10),
        Err(SessionError::NoCandidatesFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
