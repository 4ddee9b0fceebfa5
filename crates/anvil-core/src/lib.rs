//! # Anvil Core
//!
//! `anvil-core` is the target-selection and adaptive-hammering engine of anvil,
//! a DRAM disturbance prober. It resolves virtual pages to physical frames,
//! discovers aggressor targets, drives hammer bursts through a pluggable
//! [`hammerer::Hammering`] implementation and measures the effect.
//!
//! ## Main Components
//!
//! - [`memory`] - the probed [`memory::MemoryRegion`], the [`memory::PhysAddrResolver`]
//!   capability and the forced-access primitives.
//! - [`analyzer`] - mismatch counting, Shannon entropy and [`analyzer::FlipEvent`]s.
//! - [`discovery`] - latency-ranked candidates and physically contiguous triplets.
//! - [`hammerer`] - the [`hammerer::Hammering`] trait implemented by hammer engines.
//! - [`controller`] - the adaptive feedback loop and its adaptation rule.
//! - [`Session`] - ties everything together for one probing run and produces a
//!   [`SessionReport`].
//! - [`sink`] - records consumed by an external logger.
//!
//! ## Platform Support
//!
//! Designed for x86_64 Linux. Physical address resolution reads
//! `/proc/self/pagemap`, which reports frame numbers only to privileged processes.

#![warn(missing_docs)]

pub mod analyzer;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod hammerer;
pub mod memory;
mod session;
pub mod sink;
pub mod util;

pub use crate::config::{ConfigError, Mode, SessionConfig};
pub use crate::session::{
    Outcome, ResolverFactory, Session, SessionBuilder, SessionContext, SessionError,
    SessionReport,
};
pub use crate::sink::{EventSink, LogRecord, MemorySink, SinkError};
