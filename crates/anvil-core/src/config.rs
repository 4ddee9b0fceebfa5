//! Session configuration.
//!
//! [`SessionConfig`] is immutable once a session starts. It is usually built
//! from [`SessionConfig::default`] or [`SessionConfig::from_jsonfile`] and then
//! overridden field by field by the caller.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::ControllerParams;
use crate::hammerer::AccessKind;
use crate::util::{CHUNK_SIZE, LATENCY_TRIALS, PAGE_SIZE, PHYS_ADDR_MIN, Size};

/// Errors that can occur when loading or validating a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Config file is not valid JSON for a session config
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A field value is out of range or inconsistent with another field
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which probing strategy a session runs.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Hammer the slowest latency-ranked pairs
    Latency,
    /// Scan physically contiguous aggressor/victim/aggressor triplets
    Triplet,
    /// Closed-loop hammering driven by the adaptive controller
    #[default]
    Adaptive,
}

/// How the adaptive mode picks its targets.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// Latency-ranked pairs
    Latency,
    /// Contiguous triplets
    #[default]
    Contiguity,
}

/// Parameters of one probing session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Probing strategy
    pub mode: Mode,
    /// Target discovery used by the adaptive mode
    pub discovery: Discovery,
    /// Size of the probed region in bytes
    pub region_size: usize,
    /// Page size in bytes
    pub page_size: usize,
    /// Fill pattern
    pub pattern: u8,
    /// Flush/access/fence iterations per burst
    pub burst_length: u64,
    /// Idle time after each burst in microseconds
    pub cooldown_us: u64,
    /// Distance in bytes between hammered lines inside one aggressor page
    pub stride: usize,
    /// Maximum number of rounds
    pub round_budget: u64,
    /// Hammer worker threads
    pub threads: usize,
    /// Pin hammer workers to cores (best effort)
    pub pin_threads: bool,
    /// Access used on aggressors
    pub access: AccessKind,
    /// Pages below this physical address are never targeted
    pub min_phys_addr: u64,
    /// Entropy below which a chunk counts as calm
    pub entropy_low: f64,
    /// Entropy above which a chunk counts as noisy
    pub entropy_high: f64,
    /// Pacing delay change per adaptation in microseconds
    pub pacing_step_us: u64,
    /// Upper bound of the pacing delay slept per round in microseconds
    pub max_pacing_delay_us: u64,
    /// Number of latency candidates to collect
    pub candidate_count: usize,
    /// Flush-and-time trials per latency candidate
    pub latency_trials: usize,
    /// Granularity of the region state in bytes
    pub chunk_size: usize,
    /// Seed for the sampling RNG (random if absent)
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mode: Mode::default(),
            discovery: Discovery::default(),
            region_size: Size::MB(64).bytes(),
            page_size: PAGE_SIZE,
            pattern: 0xAA,
            burst_length: 100_000,
            cooldown_us: 1000,
            stride: PAGE_SIZE,
            round_budget: 1000,
            threads: 4,
            pin_threads: true,
            access: AccessKind::Load,
            min_phys_addr: PHYS_ADDR_MIN,
            entropy_low: 0.001,
            entropy_high: 0.03,
            pacing_step_us: 100,
            max_pacing_delay_us: 10_000,
            candidate_count: 32,
            latency_trials: LATENCY_TRIALS,
            chunk_size: CHUNK_SIZE,
            seed: None,
        }
    }
}

impl SessionConfig {
    /// Loads configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<SessionConfig, ConfigError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SessionConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Checks field ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.region_size == 0 || self.page_size == 0 || self.chunk_size == 0 {
            return invalid("region, page and chunk sizes must be non-zero".into());
        }
        if !self.page_size.is_power_of_two() {
            return invalid(format!("page size {} is not a power of two", self.page_size));
        }
        if !self.region_size.is_multiple_of(self.page_size) {
            return invalid(format!(
                "region size {} is not a multiple of page size {}",
                self.region_size, self.page_size
            ));
        }
        if !self.chunk_size.is_multiple_of(self.page_size) {
            return invalid(format!(
                "chunk size {} is not a multiple of page size {}",
                self.chunk_size, self.page_size
            ));
        }
        if !self.region_size.is_multiple_of(self.chunk_size) {
            return invalid(format!(
                "region size {} is not a multiple of chunk size {}",
                self.region_size, self.chunk_size
            ));
        }
        if self.stride == 0 || self.stride > self.page_size {
            return invalid(format!(
                "stride {} must be in 1..={}",
                self.stride, self.page_size
            ));
        }
        if self.threads == 0 {
            return invalid("thread count must be at least 1".into());
        }
        if self.round_budget == 0 {
            return invalid("round budget must be at least 1".into());
        }
        if self.entropy_low.is_nan() || self.entropy_high.is_nan() {
            return invalid("entropy thresholds must be numbers".into());
        }
        if self.entropy_low > self.entropy_high {
            return invalid(format!(
                "entropy low threshold {} exceeds high threshold {}",
                self.entropy_low, self.entropy_high
            ));
        }
        if self.pacing_step_us == 0 {
            return invalid("pacing step must be at least 1 us".into());
        }
        if self.max_pacing_delay_us < self.pacing_step_us {
            return invalid(format!(
                "max pacing delay {} us is below the pacing step {} us",
                self.max_pacing_delay_us, self.pacing_step_us
            ));
        }
        if let AccessKind::Store(value) = self.access
            && value != self.pattern
        {
            return invalid(format!(
                "stored byte 0x{:02x} differs from pattern 0x{:02x}",
                value, self.pattern
            ));
        }
        let needs_pairs = self.mode == Mode::Latency
            || (self.mode == Mode::Adaptive && self.discovery == Discovery::Latency);
        if needs_pairs && self.candidate_count < 2 {
            return invalid(format!(
                "latency discovery needs at least 2 candidates, got {}",
                self.candidate_count
            ));
        }
        Ok(())
    }

    /// Base cooldown between burst and measurement.
    pub fn cooldown(&self) -> Duration {
        Duration::from_micros(self.cooldown_us)
    }

    /// Number of pages in the region.
    pub fn page_count(&self) -> usize {
        self.region_size / self.page_size
    }

    /// Number of region-state chunks.
    pub fn chunk_count(&self) -> usize {
        self.region_size / self.chunk_size
    }

    /// Controller thresholds and pacing limits.
    pub fn controller_params(&self) -> ControllerParams {
        ControllerParams {
            entropy_low: self.entropy_low,
            entropy_high: self.entropy_high,
            pacing_step: Duration::from_micros(self.pacing_step_us),
            max_pacing_delay: Duration::from_micros(self.max_pacing_delay_us),
            cooldown: self.cooldown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.page_count(), 16384);
        assert_eq!(config.chunk_count(), 64);
    }

    #[test]
    fn test_validate_rejects() {
        let cases: Vec<fn(&mut SessionConfig)> = vec![
            |c| c.region_size = 0,
            |c| c.page_size = 3000,
            |c| c.region_size = 4096 * 3 + 1,
            |c| c.chunk_size = 6000,
            |c| c.region_size = 3 * 4096,
            |c| c.threads = 0,
            |c| c.round_budget = 0,
            |c| c.stride = 0,
            |c| c.entropy_low = 0.5,
            |c| c.access = AccessKind::Store(0x55),
            |c| c.pacing_step_us = 0,
            |c| c.max_pacing_delay_us = c.pacing_step_us - 1,
            |c| {
                c.mode = Mode::Latency;
                c.candidate_count = 1;
            },
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = SessionConfig {
                region_size: 4 << 20,
                ..Default::default()
            };
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "case {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_pacing_must_move() {
        let config = SessionConfig {
            pacing_step_us: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let params = SessionConfig::default().controller_params();
        assert!(params.pacing_step > Duration::ZERO);
        assert!(params.max_pacing_delay >= params.pacing_step);
    }

    #[test]
    fn test_json_partial_overrides() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"mode": "triplet", "threads": 2, "access": {"store": 170}}"#)
                .unwrap();
        assert_eq!(config.mode, Mode::Triplet);
        assert_eq!(config.threads, 2);
        assert_eq!(config.access, AccessKind::Store(0xAA));
        assert_eq!(config.pattern, 0xAA);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_jsonfile() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("anvil-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"round_budget": 7, "seed": 42}"#)?;
        let config = SessionConfig::from_jsonfile(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(config.round_budget, 7);
        assert_eq!(config.seed, Some(42));
        assert!(matches!(
            SessionConfig::from_jsonfile("/nonexistent/anvil.json"),
            Err(ConfigError::Io(_))
        ));
        Ok(())
    }
}
