//! # anvil-bin
//!
//! Support code for the `anvil` binary: logging initialisation bridged into
//! `indicatif` progress bars and the CSV event log.
//!
//! ## Quickstart guide
//!
//! ```sh
//! cargo build --release
//! sudo target/release/anvil --mode triplet --region-size 64M --log-file events.csv
//! ```
//!
//! Physical addresses are only visible to privileged processes, so triplet and
//! adaptive runs need root. Use `target/release/anvil --help` to see available
//! options. The session report is written to `results/`.
pub mod csv;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

pub use crate::csv::CsvSink;

/// Initialises `env_logger` (default filter `info`) behind a [`MultiProgress`].
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
