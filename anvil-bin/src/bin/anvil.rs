use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use anvil_bin::{CsvSink, init_logging_with_progress};
use anvil_core::config::Discovery;
use anvil_core::hammerer::AccessKind;
use anvil_core::util::Size;
use anvil_core::{Mode, Outcome, Session, SessionConfig, SessionError};
use anvil_flush::FlushHammerer;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Latency,
    Triplet,
    Adaptive,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Latency => Mode::Latency,
            ModeArg::Triplet => Mode::Triplet,
            ModeArg::Adaptive => Mode::Adaptive,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DiscoveryArg {
    Latency,
    Contiguity,
}

impl From<DiscoveryArg> for Discovery {
    fn from(discovery: DiscoveryArg) -> Self {
        match discovery {
            DiscoveryArg::Latency => Discovery::Latency,
            DiscoveryArg::Contiguity => Discovery::Contiguity,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AccessArg {
    Load,
    Store,
}

/// CLI arguments for the `anvil` binary.
///
/// Every option overrides the matching field of the configuration loaded with
/// `--config` (or of the built-in defaults).
#[derive(Debug, Parser)]
#[command(version, about = "Physical-address-aware adaptive Rowhammer prober")]
struct CliArgs {
    /// JSON session configuration. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// CSV event log.
    #[arg(long, default_value = "anvil_events.csv")]
    log_file: PathBuf,
    /// Directory for the JSON session report.
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    /// Probing strategy.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Target discovery of the adaptive mode.
    #[arg(long, value_enum)]
    discovery: Option<DiscoveryArg>,
    /// Size of the probed region, e.g. 64M.
    #[arg(long)]
    region_size: Option<Size>,
    /// Page size, e.g. 4K.
    #[arg(long)]
    page_size: Option<Size>,
    /// Granularity of the adaptive region state, e.g. 1M.
    #[arg(long)]
    chunk_size: Option<Size>,
    /// Fill pattern byte, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_byte)]
    pattern: Option<u8>,
    /// Flush/access/fence iterations per burst.
    #[arg(long)]
    burst_length: Option<u64>,
    /// Idle time after each burst in microseconds.
    #[arg(long)]
    cooldown_us: Option<u64>,
    /// Distance in bytes between hammered lines of one aggressor page.
    #[arg(long)]
    stride: Option<usize>,
    /// Maximum number of rounds.
    #[arg(long)]
    rounds: Option<u64>,
    /// Hammer worker threads.
    #[arg(long)]
    threads: Option<usize>,
    /// Do not pin hammer workers to cores.
    #[arg(long)]
    no_pin: bool,
    /// Access used on aggressors; stores write the fill pattern.
    #[arg(long, value_enum)]
    access: Option<AccessArg>,
    /// Pages below this physical address are never targeted.
    #[arg(long, value_parser = parse_u64)]
    min_phys_addr: Option<u64>,
    /// Entropy below which a chunk counts as calm.
    #[arg(long)]
    entropy_low: Option<f64>,
    /// Entropy above which a chunk counts as noisy.
    #[arg(long)]
    entropy_high: Option<f64>,
    /// Number of latency candidates.
    #[arg(long)]
    candidates: Option<usize>,
    /// Seed of the sampling RNG.
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{}: {}", s, e))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let value = parse_u64(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", s))
}

impl CliArgs {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_jsonfile(path)?,
            None => SessionConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(discovery) = self.discovery {
            config.discovery = discovery.into();
        }
        if let Some(size) = self.region_size {
            config.region_size = size.bytes();
        }
        if let Some(size) = self.page_size {
            config.page_size = size.bytes();
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size.bytes();
        }
        if let Some(pattern) = self.pattern {
            config.pattern = pattern;
        }
        if let Some(burst_length) = self.burst_length {
            config.burst_length = burst_length;
        }
        if let Some(cooldown) = self.cooldown_us {
            config.cooldown_us = cooldown;
        }
        if let Some(stride) = self.stride {
            config.stride = stride;
        }
        if let Some(rounds) = self.rounds {
            config.round_budget = rounds;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if self.no_pin {
            config.pin_threads = false;
        }
        if let Some(addr) = self.min_phys_addr {
            config.min_phys_addr = addr;
        }
        if let Some(low) = self.entropy_low {
            config.entropy_low = low;
        }
        if let Some(high) = self.entropy_high {
            config.entropy_high = high;
        }
        if let Some(candidates) = self.candidates {
            config.candidate_count = candidates;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        // stores always write the fill pattern
        match self.access {
            Some(AccessArg::Load) => config.access = AccessKind::Load,
            Some(AccessArg::Store) => config.access = AccessKind::Store(config.pattern),
            None => {}
        }
        config.validate()?;
        Ok(config)
    }
}

fn run(args: &CliArgs) -> anyhow::Result<Outcome> {
    let progress = init_logging_with_progress()?;
    let config = args.session_config()?;
    info!("Args: {:?}", args);

    let sink = CsvSink::create(&args.log_file)?;
    let hammerer = FlushHammerer::new(config.threads, config.pin_threads, config.access);
    let mut session = Session::builder(config, hammerer, sink)
        .progress(progress)
        .build()?;
    let report = match session.run() {
        Ok(report) => report,
        Err(SessionError::NoCandidatesFound(reason)) => {
            anyhow::bail!("nothing to hammer: {}", reason)
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(e) = &report.sink_error {
        warn!("Event log incomplete: {}", e);
    }

    // persist results to disk
    std::fs::create_dir_all(&args.results_dir)?;
    let now = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let results_file = args.results_dir.join(format!("results_{}.json", now));
    info!("Writing session report to {}", results_file.display());
    let mut json_file = BufWriter::new(File::create(results_file)?);
    serde_json::to_writer_pretty(&mut json_file, &report)?;
    json_file.flush()?;
    Ok(report.outcome)
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(&args) {
        Ok(Outcome::Clean) => {
            info!("No flips detected");
            ExitCode::SUCCESS
        }
        Ok(Outcome::FlipsDetected(n)) => {
            info!("{} flips detected", n);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("anvil: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
