//! Session driver.
//!
//! A [`Session`] owns everything one probing run needs: the region, the sink and
//! the counters live in a [`SessionContext`] written only by the controlling
//! thread; hammer workers only ever see [`TargetSet`]s.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Local;
use indicatif::MultiProgress;
use log::{debug, info, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::analyzer::{
    AnalyzerError, BitTransitions, FlipEvent, RegionStateTable, entropy, scan_flips,
};
use crate::config::{ConfigError, Discovery, Mode, SessionConfig};
use crate::controller::{AdaptiveController, ControllerState};
use crate::discovery::{
    AggressorVictimTriplet, CandidateTarget, LatencyDiscovery, candidate_pairs, default_pair,
    discover_triplets, find_triplets, non_overlapping_batches, resolve_region,
};
use crate::hammerer::{Hammering, TargetSet};
use crate::memory::{
    AccessTimer, AggressorPtr, FlushReloadTimer, LinuxPageMap, MemoryRegion, PhysAddrResolver,
    RegionError,
};
use crate::sink::{EventSink, LogRecord, SinkGuard};
use crate::util::{GroupBy, Rng, named_bar};

/// Builds the resolver once the region exists.
pub type ResolverFactory = Box<dyn FnOnce(&MemoryRegion) -> Box<dyn PhysAddrResolver>>;

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The region could not be mapped
    #[error("allocation failed: {0}")]
    Allocation(#[from] RegionError),
    /// Discovery produced no usable targets
    #[error("no usable targets: {0}")]
    NoCandidatesFound(String),
    /// The configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Measurement failed
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    /// The hammerer could not run a burst
    #[error("hammering failed: {0}")]
    Hammering(Box<dyn std::error::Error + Send + Sync>),
}

/// Whether a completed session observed corruption.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum Outcome {
    /// No byte ever differed from the pattern
    Clean,
    /// Number of distinct corrupted byte values observed
    FlipsDetected(usize),
}

/// Summary of a completed session.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    /// RFC 3339 start time
    pub date: String,
    /// Configuration the session ran with
    pub config: SessionConfig,
    /// Seed of the sampling RNG
    pub seed: u64,
    /// Rounds executed
    pub rounds: u64,
    /// Candidates or triplets discovered
    pub targets: usize,
    /// Triplet with the most victim flips (triplet mode)
    pub best_triplet: Option<AggressorVictimTriplet>,
    /// Mismatching bytes found by the final pass
    pub flips: Vec<FlipEvent>,
    /// Whole-region entropy at the final pass
    pub final_entropy: f64,
    /// Flipped bits by direction over every distinct corrupted byte observed
    pub transitions: BitTransitions,
    /// Overall result
    pub outcome: Outcome,
    /// First sink failure, if the sink was disabled
    pub sink_error: Option<String>,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Per-session state with a single writer: the thread running [`Session::run`].
pub struct SessionContext<S> {
    config: SessionConfig,
    region: MemoryRegion,
    sink: SinkGuard<S>,
    rng: Rng,
    seen: HashSet<(usize, u8)>,
    transitions: BitTransitions,
    rounds: u64,
}

impl<S: EventSink> SessionContext<S> {
    fn new(config: SessionConfig, sink: S) -> Result<Self, SessionError> {
        config.validate()?;
        let region = MemoryRegion::mmap(config.region_size, config.page_size)?;
        region.fill(config.pattern);
        region.touch_pages(config.pattern);
        let rng = Rng::from_optional_seed(config.seed);
        Ok(SessionContext {
            config,
            region,
            sink: SinkGuard::new(sink),
            rng,
            seen: HashSet::new(),
            transitions: BitTransitions::default(),
            rounds: 0,
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The probed region.
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Rounds executed so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Distinct corrupted byte values observed so far.
    pub fn flips_seen(&self) -> usize {
        self.seen.len()
    }

    fn emit(&mut self, record: LogRecord) {
        if let Err(e) = self.sink.record(&record) {
            trace!("{} record not written: {}", record.event_type(), e);
        }
    }

    /// Emits a FLIP row for every event not seen before; returns how many were new.
    fn observe(&mut self, events: Vec<FlipEvent>) -> usize {
        let mut new = 0;
        for event in events {
            if self.seen.insert((event.offset, event.actual)) {
                new += 1;
                self.transitions += event.transitions();
                self.emit(LogRecord::Flip(event));
            }
        }
        new
    }

    fn cooldown(&self) {
        let idle = self.config.cooldown();
        if !idle.is_zero() {
            std::thread::sleep(idle);
        }
    }

    /// Interleaves `stride`-spaced lines of the aggressor pages at `bases`.
    fn aggressor_set(&self, bases: &[AggressorPtr]) -> TargetSet {
        let addrs = (0..self.config.page_size)
            .step_by(self.config.stride)
            .flat_map(|offset| bases.iter().map(move |&base| base.wrapping_add(offset)))
            .collect();
        TargetSet::new(addrs)
    }

    fn page_ptr(&self, page: usize) -> AggressorPtr {
        self.region.page_addr(page) as AggressorPtr
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder<H, S> {
    config: SessionConfig,
    hammerer: H,
    sink: S,
    resolver_factory: Option<ResolverFactory>,
    timer: Option<Box<dyn AccessTimer>>,
    progress: Option<MultiProgress>,
}

impl<H: Hammering, S: EventSink> SessionBuilder<H, S> {
    /// Uses `resolver` instead of `/proc/self/pagemap`.
    pub fn resolver(self, resolver: impl PhysAddrResolver + 'static) -> Self {
        self.resolver_with(move |_| resolver)
    }

    /// Builds the resolver from the mapped region.
    pub fn resolver_with<R, F>(mut self, factory: F) -> Self
    where
        R: PhysAddrResolver + 'static,
        F: FnOnce(&MemoryRegion) -> R + 'static,
    {
        self.resolver_factory = Some(Box::new(
            move |region: &MemoryRegion| -> Box<dyn PhysAddrResolver> {
                Box::new(factory(region))
            },
        ));
        self
    }

    /// Uses `timer` for latency profiling instead of [`FlushReloadTimer`].
    pub fn timer(mut self, timer: impl AccessTimer + 'static) -> Self {
        self.timer = Some(Box::new(timer));
        self
    }

    /// Reports progress bars to `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the configuration, maps and fills the region.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] or [`SessionError::Allocation`].
    pub fn build(self) -> Result<Session<H, S>, SessionError> {
        let ctx = SessionContext::new(self.config, self.sink)?;
        let resolver: Box<dyn PhysAddrResolver> = match self.resolver_factory {
            Some(factory) => factory(&ctx.region),
            None => Box::new(LinuxPageMap::new()),
        };
        Ok(Session {
            ctx,
            hammerer: self.hammerer,
            resolver,
            timer: self.timer.unwrap_or_else(|| Box::new(FlushReloadTimer)),
            progress: self.progress,
        })
    }
}

/// Discovery output of one mode.
struct ModeSummary {
    targets: usize,
    best_triplet: Option<AggressorVictimTriplet>,
}

/// One probing run: discovery, hammering and measurement over a single region.
///
/// # Examples
///
/// ```no_run
/// use anvil_core::{MemorySink, Session, SessionConfig};
/// # fn run(hammerer: impl anvil_core::hammerer::Hammering) -> Result<(), anvil_core::SessionError> {
/// let mut session = Session::builder(SessionConfig::default(), hammerer, MemorySink::new()).build()?;
/// let report = session.run()?;
/// println!("{:?}", report.outcome);
/// # Ok(())
/// # }
/// ```
pub struct Session<H: Hammering, S: EventSink> {
    ctx: SessionContext<S>,
    hammerer: H,
    resolver: Box<dyn PhysAddrResolver>,
    timer: Box<dyn AccessTimer>,
    progress: Option<MultiProgress>,
}

impl<H: Hammering, S: EventSink> Session<H, S> {
    /// Starts building a session.
    pub fn builder(config: SessionConfig, hammerer: H, sink: S) -> SessionBuilder<H, S> {
        SessionBuilder {
            config,
            hammerer,
            sink,
            resolver_factory: None,
            timer: None,
            progress: None,
        }
    }

    /// Session state.
    pub fn context(&self) -> &SessionContext<S> {
        &self.ctx
    }

    /// Releases the region and returns the sink.
    pub fn into_sink(self) -> S {
        self.ctx.sink.into_inner()
    }

    /// Runs the configured mode followed by a final analysis pass.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoCandidatesFound`] if discovery yields nothing to
    /// hammer, [`SessionError::Hammering`] if a burst could not run.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let start = Instant::now();
        let date = Local::now().to_rfc3339();
        let config = self.ctx.config.clone();
        info!(
            "Starting {:?} session: {} bytes, {} threads, {} rounds, seed {}",
            config.mode,
            config.region_size,
            config.threads,
            config.round_budget,
            self.ctx.rng.seed()
        );
        let summary = match config.mode {
            Mode::Latency => self.run_latency(&config)?,
            Mode::Triplet => self.run_triplet(&config)?,
            Mode::Adaptive => self.run_adaptive(&config)?,
        };
        let (flips, final_entropy) = self.final_pass(&config)?;
        if let Err(e) = self.ctx.sink.flush() {
            debug!("Sink flush skipped: {}", e);
        }

        let outcome = match self.ctx.flips_seen() {
            0 => Outcome::Clean,
            n => Outcome::FlipsDetected(n),
        };
        info!("Session finished after {} rounds: {:?}", self.ctx.rounds, outcome);
        Ok(SessionReport {
            date,
            config,
            seed: self.ctx.rng.seed(),
            rounds: self.ctx.rounds,
            targets: summary.targets,
            best_triplet: summary.best_triplet,
            flips,
            final_entropy,
            transitions: self.ctx.transitions,
            outcome,
            sink_error: self.ctx.sink.failure().map(str::to_string),
            duration: start.elapsed(),
        })
    }

    fn hammer(&self, sets: &[TargetSet]) -> Result<(), SessionError> {
        self.hammerer
            .hammer_burst(sets, self.ctx.config.burst_length)
            .map_err(|e| SessionError::Hammering(Box::new(e)))
    }

    fn latency_candidates(&mut self, config: &SessionConfig) -> Vec<CandidateTarget> {
        LatencyDiscovery {
            candidate_count: config.candidate_count,
            trials: config.latency_trials,
            min_phys_addr: config.min_phys_addr,
        }
        .discover(
            &self.ctx.region,
            self.resolver.as_mut(),
            self.timer.as_ref(),
            &mut self.ctx.rng,
            self.progress.as_ref(),
        )
    }

    fn pair_set(&self, pair: &(CandidateTarget, CandidateTarget)) -> TargetSet {
        self.ctx.aggressor_set(&[pair.0.ptr(), pair.1.ptr()])
    }

    fn run_latency(&mut self, config: &SessionConfig) -> Result<ModeSummary, SessionError> {
        let ranked = self.latency_candidates(config);
        let (first, second) = default_pair(&ranked).ok_or_else(|| {
            SessionError::NoCandidatesFound(format!(
                "{} latency candidates, need 2",
                ranked.len()
            ))
        })?;
        info!(
            "Default pair: {:#x} ({:?}, ~{} ns), {:#x} ({:?}, ~{} ns)",
            first.address,
            first.physical_address,
            first.measured_latency_ns,
            second.address,
            second.physical_address,
            second.measured_latency_ns
        );
        let sets = candidate_pairs(&ranked, config.threads)
            .iter()
            .map(|pair| self.pair_set(pair))
            .collect::<Vec<_>>();

        let bar = named_bar(self.progress.as_ref(), "Latency bursts", config.round_budget);
        for round in 0..config.round_budget {
            self.hammer(&sets)?;
            self.ctx.cooldown();
            self.ctx.rounds = round + 1;
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        Ok(ModeSummary {
            targets: ranked.len(),
            best_triplet: None,
        })
    }

    fn run_triplet(&mut self, config: &SessionConfig) -> Result<ModeSummary, SessionError> {
        let page_size = config.page_size;
        let phys = resolve_region(&self.ctx.region, self.resolver.as_mut());
        let triplets = find_triplets(&phys, page_size, config.min_phys_addr);
        if triplets.is_empty() {
            return Err(SessionError::NoCandidatesFound(format!(
                "no physically contiguous triplets above {:#x}",
                config.min_phys_addr
            )));
        }
        let batches = non_overlapping_batches(&triplets, config.threads);
        let rounds = batches.len().min(config.round_budget as usize);
        if rounds < batches.len() {
            warn!(
                "Round budget {} covers {} of {} triplet batches; raise it to scan every triplet",
                config.round_budget,
                rounds,
                batches.len()
            );
        }
        info!(
            "Scanning {} triplets in {} batches ({} within round budget)",
            triplets.len(),
            batches.len(),
            rounds
        );

        let bar = named_bar(self.progress.as_ref(), "Triplet batches", rounds as u64);
        let mut best: Option<AggressorVictimTriplet> = None;
        let mut total_flips = 0;
        for (round, batch) in batches.into_iter().take(rounds).enumerate() {
            for page in batch.iter().flat_map(|t| t.pages()) {
                self.ctx
                    .region
                    .fill_range(page * page_size, page_size, config.pattern);
            }
            let sets = batch
                .iter()
                .map(|t| {
                    let [a1, a2] = t.aggressors();
                    self.ctx
                        .aggressor_set(&[self.ctx.page_ptr(a1), self.ctx.page_ptr(a2)])
                })
                .collect::<Vec<_>>();
            self.hammer(&sets)?;
            self.ctx.cooldown();

            for mut triplet in batch {
                let offset = triplet.victim_index * page_size;
                self.ctx.region.flush_range(offset, page_size);
                let events = scan_flips(
                    self.ctx.region.slice(offset, page_size),
                    config.pattern,
                    offset,
                );
                triplet.flip_count = events.len();
                total_flips += events.len();
                self.ctx.observe(events);
                if triplet.flip_count > 0 {
                    info!(
                        "Triplet at page {}: {} victim flips",
                        triplet.aggressor1_index, triplet.flip_count
                    );
                }
                if triplet.flip_count > best.map_or(0, |b| b.flip_count) {
                    best = Some(triplet);
                }
                let phys = triplet.pages().map(|p| phys[p].unwrap_or_default());
                self.ctx.emit(LogRecord::Triplet {
                    round: round as u64,
                    triplet,
                    phys,
                });
            }
            self.ctx.rounds = round as u64 + 1;
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        match best {
            Some(best) => info!(
                "Total victim flips: {}, best triplet at page {} ({} flips)",
                total_flips, best.aggressor1_index, best.flip_count
            ),
            None => info!("No victim flips in {} scanned batches", rounds),
        }
        Ok(ModeSummary {
            targets: triplets.len(),
            best_triplet: best,
        })
    }

    /// Hammer batches per chunk; sets within one batch touch disjoint pages.
    fn adaptive_targets(
        &mut self,
        config: &SessionConfig,
    ) -> (usize, HashMap<usize, Vec<Vec<TargetSet>>>) {
        let chunk_of = |offset: usize| offset / config.chunk_size;
        match config.discovery {
            Discovery::Contiguity => {
                let triplets =
                    discover_triplets(&self.ctx.region, self.resolver.as_mut(), config.min_phys_addr);
                let count = triplets.len();
                let batches = triplets
                    .group_by(|t| chunk_of(t.victim_index * config.page_size))
                    .into_iter()
                    .map(|(chunk, triplets)| {
                        let batches: Vec<Vec<TargetSet>> =
                            non_overlapping_batches(&triplets, config.threads)
                            .iter()
                            .map(|batch| {
                                batch
                                    .iter()
                                    .map(|t| {
                                        let [a1, a2] = t.aggressors();
                                        self.ctx.aggressor_set(&[
                                            self.ctx.page_ptr(a1),
                                            self.ctx.page_ptr(a2),
                                        ])
                                    })
                                    .collect()
                            })
                            .collect();
                        (chunk, batches)
                    })
                    .collect();
                (count, batches)
            }
            Discovery::Latency => {
                let ranked = self.latency_candidates(config);
                let count = ranked.len();
                let batches = candidate_pairs(&ranked, usize::MAX)
                    .group_by(|(a, _)| chunk_of(self.ctx.region.offset_of(a.ptr()).unwrap_or(0)))
                    .into_iter()
                    .map(|(chunk, pairs)| {
                        let batches: Vec<Vec<TargetSet>> = pairs
                            .chunks(config.threads)
                            .map(|batch| batch.iter().map(|pair| self.pair_set(pair)).collect())
                            .collect();
                        (chunk, batches)
                    })
                    .collect();
                (count, batches)
            }
        }
    }

    fn run_adaptive(&mut self, config: &SessionConfig) -> Result<ModeSummary, SessionError> {
        let (targets, batches) = self.adaptive_targets(config);
        if batches.is_empty() {
            return Err(SessionError::NoCandidatesFound(format!(
                "{:?} discovery found no targets",
                config.discovery
            )));
        }
        info!(
            "{} targets spread over {} of {} chunks",
            targets,
            batches.len(),
            config.chunk_count()
        );

        let mut table = RegionStateTable::new(config.region_size, config.chunk_size)?;
        let mut controller =
            AdaptiveController::new(config.controller_params(), table.len(), config.round_budget);
        let mut cursors: HashMap<usize, usize> = HashMap::new();
        let bar = named_bar(self.progress.as_ref(), "Adaptive rounds", config.round_budget);
        loop {
            match controller.state() {
                ControllerState::Bursting => {
                    let chunk = controller.active_chunk();
                    match batches.get(&chunk) {
                        Some(chunk_batches) if !chunk_batches.is_empty() => {
                            let cursor = cursors.entry(chunk).or_default();
                            let batch = &chunk_batches[*cursor % chunk_batches.len()];
                            *cursor += 1;
                            self.hammer(batch)?;
                        }
                        _ => trace!("Chunk {} has no targets, idling", chunk),
                    }
                    controller.finish_burst();
                }
                ControllerState::Cooldown => controller.cool_down(),
                ControllerState::Sampling => {
                    table.sample(&self.ctx.region, config.pattern)?;
                    let round = controller.round();
                    for (chunk, state) in table.chunks().iter().enumerate() {
                        self.ctx.emit(LogRecord::Region {
                            round,
                            chunk,
                            entropy: state.entropy,
                            flip_count: state.flip_count,
                        });
                    }
                    for chunk in (0..table.len()).filter(|&c| table.chunks()[c].flip_count > 0) {
                        let offset = chunk * config.chunk_size;
                        let events = scan_flips(
                            self.ctx.region.slice(offset, config.chunk_size),
                            config.pattern,
                            offset,
                        );
                        let new = self.ctx.observe(events);
                        if new > 0 {
                            info!("Round {}: {} new flips in chunk {}", round, new, chunk);
                        }
                    }
                    let region_entropy = entropy(self.ctx.region.as_slice())?;
                    self.ctx.emit(LogRecord::entropy(region_entropy));
                    let adaptation = controller.sampled(&table);
                    trace!("{:?}", adaptation);
                    self.ctx.rounds = controller.round();
                    if let Some(bar) = &bar {
                        bar.set_message(format!(
                            "chunk {} delay {:?}",
                            controller.active_chunk(),
                            controller.pacing_delay()
                        ));
                        bar.inc(1);
                    }
                }
                ControllerState::Done => break,
            }
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        Ok(ModeSummary {
            targets,
            best_triplet: None,
        })
    }

    fn final_pass(&mut self, config: &SessionConfig) -> Result<(Vec<FlipEvent>, f64), SessionError> {
        let region = &self.ctx.region;
        region.flush_range(0, region.len());
        let flips = scan_flips(region.as_slice(), config.pattern, 0);
        let final_entropy = entropy(region.as_slice())?;
        if !flips.is_empty() {
            warn!("{} bytes differ from pattern 0x{:02x}", flips.len(), config.pattern);
        }
        self.ctx.observe(flips.clone());
        self.ctx.emit(LogRecord::entropy(final_entropy));
        info!(
            "Final pass: {} mismatching bytes, entropy {:.6}",
            flips.len(),
            final_entropy
        );
        Ok((flips, final_entropy))
    }
}
